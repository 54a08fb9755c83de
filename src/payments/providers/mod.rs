pub mod momo;

pub use momo::{MomoConfig, MomoProvider};
