//! # Nomad Configuration Validator
//!
//! Loads a configuration file (or environment overrides only), validates it
//! and prints the effective values. Exits non-zero on any error.
//!
//! ```text
//! config-validator [PATH] [--json]
//! ```

use std::process;

use nomad_core::config::{ConfigManager, NomadConfig, PollingStrategyKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

struct Args {
    path: Option<String>,
    json: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        path: None,
        json: false,
    };

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--json" => args.json = true,
            "-h" | "--help" => {
                println!("Usage: config-validator [PATH] [--json]");
                process::exit(0);
            }
            flag if flag.starts_with('-') => return Err(format!("unknown flag '{flag}'")),
            path if args.path.is_none() => args.path = Some(path.to_string()),
            extra => return Err(format!("unexpected argument '{extra}'")),
        }
    }

    Ok(args)
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .try_init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("❌ {e}");
            eprintln!("Usage: config-validator [PATH] [--json]");
            process::exit(2);
        }
    };

    let loaded = match &args.path {
        Some(path) => ConfigManager::load_from_file(path),
        None => ConfigManager::load(),
    };

    let manager = match loaded {
        Ok(manager) => manager,
        Err(e) => {
            error!("Configuration validation failed: {e}");
            println!("❌ Configuration is invalid");
            if let Some(field) = e.field() {
                println!("   Field: {field}");
            }
            println!("   {e}");
            process::exit(1);
        }
    };

    info!("Configuration validation completed successfully");

    if args.json {
        match serde_json::to_string_pretty(manager.config()) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("❌ Failed to serialize configuration: {e}");
                process::exit(1);
            }
        }
        return;
    }

    let source = manager
        .source()
        .map_or_else(|| "environment only".to_string(), |p| p.display().to_string());
    println!("🔧 Nomad Configuration");
    println!("Source: {source}");
    println!();
    print_summary(manager.config());
    println!();
    println!("✅ Configuration is valid");
}

fn print_summary(config: &NomadConfig) {
    let scheduler = &config.scheduler;
    println!("📋 Scheduler");
    println!("   enabled:           {}", scheduler.enabled);
    println!("   poll interval:     {}s", scheduler.poll_interval_seconds);
    println!("   tick timeout:      {}s", scheduler.tick_timeout_seconds);
    println!("   drain timeout:     {}s", scheduler.drain_timeout_seconds);
    println!("   strategy:          {:?}", scheduler.strategy);
    println!("   max backoff:       {}s", scheduler.max_backoff_seconds);
    match scheduler.strategy {
        PollingStrategyKind::Adaptive => println!(
            "   adaptive range:    {}s-{}s (queue threshold {})",
            scheduler.adaptive.min_interval_seconds,
            scheduler.adaptive.max_interval_seconds,
            scheduler.adaptive.queue_threshold
        ),
        PollingStrategyKind::ScheduledWindows => {
            for window in &scheduler.windows {
                println!(
                    "   window:            {:02}:00-{:02}:00 {:?} (UTC{:+})",
                    window.start_hour, window.end_hour, window.days, scheduler.utc_offset_hours
                );
            }
        }
        PollingStrategyKind::Fixed | PollingStrategyKind::ExponentialBackoff => {}
    }

    println!("🛡️ Circuit breakers");
    for (name, settings) in [
        ("polling", &config.circuit_breakers.polling),
        ("processing", &config.circuit_breakers.processing),
    ] {
        println!(
            "   {name:<11} threshold {} / cooldown {}s",
            settings.failure_threshold, settings.cooldown_seconds
        );
    }

    let dispatcher = &config.dispatcher;
    println!("⚙️ Dispatcher");
    println!("   workers:           {}", dispatcher.worker_count);
    println!("   queue capacity:    {}", dispatcher.queue_capacity);
    println!("   handler timeout:   {}s", dispatcher.handler_timeout_seconds);
    println!("   shutdown grace:    {}s", dispatcher.shutdown_grace_seconds);

    println!("🔒 Locking");
    println!("   ttl:               {}s", config.locking.ttl_seconds);

    let transitions = &config.transitions;
    println!("🔁 Transitions");
    println!("   max retries:       {}", transitions.max_retries);
    println!("   history limit:     {}", transitions.history_limit);
    println!("   resume from origin: {}", transitions.allow_resume_from_origin);

    println!("📝 Logging");
    println!(
        "   level:             {}",
        config.logging.level.as_deref().unwrap_or("(environment default)")
    );
    println!("   format:            {:?}", config.logging.format);
}
