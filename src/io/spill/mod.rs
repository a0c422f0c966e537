pub(crate) mod format;
mod record;
mod state;
mod stream;

pub use format::{BatchEncoding, FixedEncoding, RecordEncoding};
pub use record::SpillRecord;
pub use state::SpillState;
pub use stream::{SpillSink, StreamSink, StreamSource};
