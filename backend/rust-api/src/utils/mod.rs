pub mod retry;
pub mod sampling;
pub mod similarity;
