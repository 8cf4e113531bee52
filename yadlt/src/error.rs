use std::error::Error;

/// Error type of trait methods whose implementations have their own error
/// enums.
pub type BoxedError = Box<dyn Error + Send + Sync>;
