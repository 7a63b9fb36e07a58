//! Gateway walkthrough.
//!
//! Shows the request flow a module handler follows: check, do the work,
//! charge, and the administrative side that seeds and inspects keys.
//!
//! # Running
//!
//! ```bash
//! cargo run --example gateway_walkthrough
//! ```
//!
//! Uses an in-memory database, so nothing is written to disk.

use chrono::{Duration, Utc};
use keywarden::audit::entries::AdminContext;
use keywarden::audit::query::{DecisionLogFilters, Page};
use keywarden::{ChargeError, GatewayRequest, KeyManager, KeywardenConfig, Module, NewKey};

fn main() {
    let manager = match KeyManager::new(KeywardenConfig::default()) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Expiry dates are written in local time (UTC+7 by default).
    let tomorrow = (Utc::now() + Duration::hours(7) + Duration::days(1))
        .format("%Y-%m-%d")
        .to_string();

    let admin = AdminContext {
        ip: Some("127.0.0.1".into()),
        user_agent: Some("walkthrough".into()),
    };
    if let Err(e) = manager.add_key(
        NewKey::new("ABC", Module::Voice).expires(tomorrow).max_usage(3),
        &admin,
    ) {
        eprintln!("Could not create key: {}", e);
        std::process::exit(1);
    }

    // A handler checks every request before doing any work.
    for device in ["dev1", "dev2"] {
        let request = GatewayRequest::new(Module::Voice)
            .key("ABC")
            .device_id(device)
            .endpoint("generate")
            .ip("203.0.113.7");

        match manager.authorize(&request) {
            Ok(decision) if decision.is_allowed() => println!(
                "{}: allowed, expires {}, remaining {}",
                device,
                decision.expires_display().unwrap_or_default(),
                decision
                    .remaining()
                    .map(|r| r.to_string())
                    .unwrap_or_default()
            ),
            Ok(decision) => println!("{}: denied [{}] {}", device, decision.code(), decision.message()),
            Err(e) => eprintln!("{}: storage failure: {}", device, e),
        }
    }

    // After the work succeeds, charge one unit per generation.
    loop {
        match manager.charge_one("ABC", "dev1", Module::Voice) {
            Ok(remaining) => println!("charged 1, remaining {}", remaining),
            Err(e @ ChargeError::QuotaExceeded { .. }) => {
                println!("charge refused: {} (retryable: {})", e, e.is_retryable());
                break;
            }
            Err(e) => {
                eprintln!("charge failed: {}", e);
                break;
            }
        }
    }

    // The administrative side sees every decision.
    match manager.list_decision_log(&DecisionLogFilters::default(), Page::default()) {
        Ok(entries) => {
            for entry in entries {
                println!(
                    "log: {} {} {} -> {:?} {}",
                    entry.created_at.format("%H:%M:%S"),
                    entry.module,
                    entry.device_id.unwrap_or_default(),
                    entry.response_status,
                    entry.response_message.unwrap_or_default()
                );
            }
        }
        Err(e) => eprintln!("Could not read decision log: {}", e),
    }
}
