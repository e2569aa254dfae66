pub mod signature;
pub mod timing;
