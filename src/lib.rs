//! OCR gateway for stockpile screenshots.
//!
//! Routes each uploaded image to either a local automation pipeline or a
//! remote accelerated OCR service, based on free accelerator memory, and
//! returns a TSV report.

pub mod artifact;
pub mod backend;
pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod probe;
pub mod routing;
pub mod server;
pub mod staging;

#[cfg(test)]
mod test_support;
