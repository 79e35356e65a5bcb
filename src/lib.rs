//! Skin lesion prediction service
//!
//! Accepts an uploaded image, scores it with a pretrained binary classifier,
//! keeps the image and the verdict, and serves the verdict history.

pub mod error;
pub mod model;
pub mod records;
pub mod routes;
pub mod storage;
pub mod utils;

pub use error::{Error, Result};
