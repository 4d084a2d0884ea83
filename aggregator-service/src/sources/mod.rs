pub mod http_json;
pub mod reading_backfill_file;
pub mod reading_delimited_file;

pub use http_json::HttpJsonSource;
pub use reading_backfill_file::ReadingBackfillFileSource;
pub use reading_delimited_file::ReadingDelimitedFileSource;
