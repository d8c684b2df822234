pub mod decision;
pub mod stream;
