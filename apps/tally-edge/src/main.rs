//! # Tally Edge Entry Point
//!
//! The actual setup lives in `lib.rs` so it can be tested.

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tally_edge::run().await
}
