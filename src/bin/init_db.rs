use sqlx::postgres::PgPool;
use std::env;

use agentchat::db::{run_migrations, server_and_database};

/// Creates the database named in DATABASE_URL when it is missing, applies the
/// migrations and prints what is installed.
#[tokio::main]
async fn main() -> Result<(), sqlx::Error> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_target(false).init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let (server_options, database) = server_and_database(&database_url)?;

    println!("Connecting to server...");
    let server = PgPool::connect_with(server_options.clone()).await?;

    let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&database)
        .fetch_one(&server)
        .await?;

    if exists {
        println!("✅ Database {} already exists", database);
    } else {
        // identifiers cannot be bound as parameters
        let quoted = format!("\"{}\"", database.replace('"', "\"\""));
        sqlx::query(&format!("CREATE DATABASE {}", quoted))
            .execute(&server)
            .await?;
        println!("✅ Created database {}", database);
    }
    server.close().await;

    let pool = PgPool::connect_with(server_options.database(&database)).await?;
    run_migrations(&pool).await.map_err(|e| {
        println!("❌ Migrations failed: {}", e);
        e
    })?;

    let migrations = sqlx::query_as::<_, (i64, String, bool)>(
        "SELECT version, description, success FROM _sqlx_migrations ORDER BY version",
    )
    .fetch_all(&pool)
    .await?;

    println!("✅ Migrations:");
    for (version, description, success) in migrations {
        println!("  - {} {} (Succeeded: {})", version, description, success);
    }

    let tables = sqlx::query_as::<_, (String,)>(
        "SELECT tablename FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename",
    )
    .fetch_all(&pool)
    .await?;
    println!("Tables:");
    for (table,) in tables {
        println!("  - {}", table);
    }

    Ok(())
}
