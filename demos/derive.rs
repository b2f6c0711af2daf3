//! Example demonstrating the #[derive(Service)] macro
//!
//! Run with:
//!   cargo run --example derive --features derive

use di_runtime::verified::{ServiceModule, ServiceProvider};
use di_runtime::{Container, Service};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// Dependencies
#[derive(Service)]
struct Config {
    // Non-dep fields use Default
    max_connections: u32,
}

#[derive(Service)]
struct Database {
    #[dep]
    config: Arc<Config>,
    queries: AtomicU64,
}

impl Database {
    fn query(&self, sql: &str) -> String {
        let n = self.queries.fetch_add(1, Ordering::Relaxed) + 1;
        format!("#{n} {sql} (pool of {})", self.config.max_connections)
    }
}

#[derive(Service)]
struct Cache {
    hits: AtomicU64,
}

// Service with two dependencies
#[derive(Service)]
struct UserService {
    #[dep]
    db: Arc<Database>,
    #[dep]
    cache: Arc<Cache>,
}

impl UserService {
    fn find_user(&self, id: u64) -> String {
        self.cache.hits.fetch_add(1, Ordering::Relaxed);
        self.db.query(&format!("SELECT * FROM users WHERE id = {id}"))
    }
}

struct AppModule;

impl ServiceModule for AppModule {
    fn register(container: &Container) -> di_runtime::Result<()> {
        container.provide_singleton::<Config>()?;
        container.provide_singleton::<Database>()?;
        container.provide_scoped::<Cache>()?;
        container.provide_transient::<UserService>()
    }
}

#[tokio::main]
async fn main() -> di_runtime::Result<()> {
    println!("=== #[derive(Service)] Demo ===\n");

    let container = Container::new();
    AppModule::register(&container)?;

    for descriptor in container.descriptors() {
        println!(
            "{:<40} {:<10} deps: {:?}",
            descriptor.key().to_string(),
            descriptor.lifetime(),
            descriptor
                .dependencies()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        );
    }
    println!();

    for request in 1..=2 {
        let scope = container.create_scope()?;
        let a = scope.resolve::<UserService>().await?;
        let b = scope.resolve::<UserService>().await?;

        println!("[request {request}] {}", a.find_user(42));
        println!("[request {request}] {}", b.find_user(7));
        println!(
            "[request {request}] shared cache: {}, hits: {}",
            Arc::ptr_eq(&a.cache, &b.cache),
            a.cache.hits.load(Ordering::Relaxed)
        );

        scope.close().await?;
    }

    container.shutdown().await?;
    println!("\n=== Demo Complete ===");
    Ok(())
}
