pub mod config;
pub mod lock;
pub mod semantic;
pub mod storage;
#[cfg(test)]
mod tests;
