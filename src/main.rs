//! relay-call Binary
//!
//! ```bash
//! relay-call [nickname] [relay-url]
//! ```

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay_call::run().await
}
