pub mod driver;
pub mod ir;
pub mod opt;
