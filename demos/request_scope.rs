//! A request-per-scope web handler pipeline
//!
//! A singleton logger, a repository per request and a fresh handler per
//! call. Each request runs in its own scope, which is closed (and its
//! services disposed) when the request finishes, even if the handler fails.
//!
//! Run with:
//!   cargo run --example request_scope

use async_trait::async_trait;
use di_runtime::{
    CaptiveValidation, Container, ContainerOptions, DiError, HookError, Lifetime, ServiceKey,
    ServiceLifecycle,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

struct Logger {
    lines: AtomicU32,
}

impl Logger {
    fn log(&self, msg: &str) {
        let n = self.lines.fetch_add(1, Ordering::Relaxed);
        println!("  [log {n:03}] {msg}");
    }
}

#[async_trait]
impl ServiceLifecycle for Logger {
    async fn dispose(&self) -> Result<(), HookError> {
        println!("  [logger] flushed {} lines", self.lines.load(Ordering::Relaxed));
        Ok(())
    }
}

struct Repository {
    logger: Arc<Logger>,
    id: u32,
}

#[async_trait]
impl ServiceLifecycle for Repository {
    async fn initialize(&self) -> Result<(), HookError> {
        self.logger.log(&format!("repository #{} opened a transaction", self.id));
        Ok(())
    }

    async fn dispose(&self) -> Result<(), HookError> {
        self.logger.log(&format!("repository #{} committed", self.id));
        Ok(())
    }
}

struct RequestHandler {
    repo: Arc<Repository>,
}

impl RequestHandler {
    fn handle(&self, path: &str) -> Result<String, String> {
        if path == "/boom" {
            return Err(format!("no route for {path}"));
        }
        Ok(format!("200 OK {path} via repository #{}", self.repo.id))
    }
}

fn compose() -> di_runtime::Result<Container> {
    let container = Container::with_options(
        ContainerOptions::new()
            .capacity(16)
            .captive_validation(CaptiveValidation::Eager),
    );

    container
        .service::<Logger>(Lifetime::Singleton)
        .with_lifecycle()
        .factory(|_| {
            Ok(Logger {
                lines: AtomicU32::new(0),
            })
        })?;

    let next_id = Arc::new(AtomicU32::new(1));
    container
        .service::<Repository>(Lifetime::Scoped)
        .depends_on::<Logger>()
        .with_lifecycle()
        .factory(move |deps| {
            Ok(Repository {
                logger: deps.get()?,
                id: next_id.fetch_add(1, Ordering::Relaxed),
            })
        })?;

    container.register_transient(&[ServiceKey::of::<Repository>()], |deps| {
        Ok(RequestHandler { repo: deps.get()? })
    })?;

    // Surface wiring mistakes before serving anything
    container.seal()?;
    Ok(container)
}

#[tokio::main]
async fn main() -> di_runtime::Result<()> {
    println!("=== Request Scope Demo ===\n");

    let container = compose()?;

    for path in ["/users", "/orders", "/boom"] {
        println!("GET {path}");
        let outcome = container
            .with_scope(|scope| async move {
                let handler = scope.resolve::<RequestHandler>().await?;
                // Two handlers in one request share the repository
                let audit = scope.resolve::<RequestHandler>().await?;
                assert!(Arc::ptr_eq(&handler.repo, &audit.repo));
                Ok::<_, DiError>(handler.handle(path))
            })
            .await??;

        match outcome {
            Ok(body) => println!("  -> {body}"),
            Err(err) => println!("  -> 404 {err}"),
        }
    }

    println!("\nShutting down");
    container.shutdown().await?;

    println!("\n=== Demo Complete ===");
    Ok(())
}
