//! Example demonstrating logging capabilities
//!
//! Run with JSON logging (production):
//! ```bash
//! cargo run --example logging --features logging-json
//! ```
//!
//! Run with pretty logging (development):
//! ```bash
//! cargo run --example logging --features logging-pretty
//! ```
//!
//! Narrow the output with `RUST_LOG`, e.g. `RUST_LOG=di_runtime=trace`.

use async_trait::async_trait;
use di_runtime::{Container, HookError, Lifetime, ServiceKey, ServiceLifecycle};

#[allow(dead_code)]
struct Database {
    url: String,
}

#[async_trait]
impl ServiceLifecycle for Database {
    async fn initialize(&self) -> Result<(), HookError> {
        println!("  [App] Connecting to {}", self.url);
        Ok(())
    }

    async fn dispose(&self) -> Result<(), HookError> {
        println!("  [App] Closing connection pool");
        Ok(())
    }
}

#[allow(dead_code)]
struct RequestContext {
    request_id: String,
}

/// A service whose initialize hook always fails.
struct Mailer;

#[async_trait]
impl ServiceLifecycle for Mailer {
    async fn initialize(&self) -> Result<(), HookError> {
        Err("SMTP relay unreachable".into())
    }
}

#[tokio::main]
async fn main() -> di_runtime::Result<()> {
    // JSON if logging-json is enabled, pretty if only logging-pretty is
    di_runtime::logging::init();

    println!("=== di-runtime Logging Demo ===\n");

    let container = Container::new();

    // Registrations (logs: "Registering service")
    container
        .service::<Database>(Lifetime::Singleton)
        .with_lifecycle()
        .factory(|_| {
            Ok(Database {
                url: "postgres://localhost/mydb".into(),
            })
        })?;

    container.register_scoped(&[ServiceKey::of::<Database>()], |_| {
        Ok(RequestContext {
            request_id: "req-12345".into(),
        })
    })?;

    container
        .service::<Mailer>(Lifetime::Transient)
        .depends_on::<Database>()
        .with_lifecycle()
        .factory(|_| Ok(Mailer))?;

    // First resolution seals the registry (logs: "Registry sealed - no further registrations allowed")
    let _db = container.resolve::<Database>().await?;

    // Unregistered keys (logs: "Resolution failed")
    let missing = container.try_resolve::<i32>().await?;
    assert!(missing.is_none());

    // A request scope (logs: "Opened scope", "Constructed service", "Scoped cache hit")
    let scope = container.create_scope()?;
    let _ctx = scope.resolve::<RequestContext>().await?;
    let _again = scope.resolve::<RequestContext>().await?;

    // A failing initialize hook (logs: "Initialize hook failed", "Resolution failed")
    if let Err(err) = scope.resolve::<Mailer>().await {
        println!("  [App] Mailer unavailable: {err}");
    }

    // (logs: "Closing scope")
    scope.close().await?;

    // Teardown (logs: "Shutting down DI container", "Disposing service")
    container.shutdown().await?;

    println!("\n=== Demo Complete ===");
    Ok(())
}
