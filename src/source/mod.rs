// Source image download: the upstream HTTP fetcher and its trait.

pub mod http_source;
pub mod traits;
