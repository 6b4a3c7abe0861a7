use stress_test::{stress_test_clients, stress_test_scaling, stress_test_submit};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start runtime: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = rt.block_on(async_main()) {
        eprintln!("stress run aborted: {}", err);
        std::process::exit(1);
    }
}

async fn async_main() -> arbor_sdk::Result<()> {
    println!("Started {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            ASYNC STRESS TESTS                              ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: few writers, many objects (little contention)
    let stats = stress_test_submit(4, 100, 32).await?;
    stats.print();

    // Test 2: many writers on two objects (heavy lock contention)
    let stats = stress_test_submit(16, 50, 2).await?;
    stats.print();

    // Test 3: offline clients reconciling
    stress_test_clients(6, 20, 5).await?;

    // Test 4: scaling analysis
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS                                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    stress_test_scaling(16, 4).await?;

    println!("\n✓ All stress tests completed!");
    Ok(())
}
