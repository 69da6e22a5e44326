pub mod config;
pub mod detector;
pub mod error;
pub mod frame;
pub mod image;
pub mod my_types;
pub mod optical_flow;
pub mod publisher;
pub mod pyramid;
pub mod recorder;
pub mod source;
pub mod tracker;
pub mod visualization;

#[cfg(test)]
mod testing;
