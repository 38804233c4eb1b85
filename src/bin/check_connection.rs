use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use chrono_tz::Europe::London;
use meterstat::{
    config_from_env, fetch_interval_readings, AccountSession, FetchConfig, FetchWindow,
    GlowmarktClient, IntervalReading, KrakenClient, SecondaryReadingSource, DAY_MS,
};

const CHECK_DAYS: i64 = 7;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = config_from_env()?;

    println!("Logging in as {}...", config.account.username);
    let client = KrakenClient::new(config.account.clone(), config.http_timeout_ms)?;
    client.login().await?;
    println!("Login successful.");

    let now_ts = Utc::now().timestamp_millis();
    let window = FetchWindow {
        start_ts_ms_utc: now_ts - CHECK_DAYS * DAY_MS,
        end_ts_ms_utc: now_ts,
    };

    let accounts = client.account_numbers().await?;
    println!("Found accounts: {accounts:?}");

    for account in &accounts {
        println!("Fetching meters for account {account}...");
        for meter in client.meters(account).await? {
            println!(
                "  - ({}) {} (ID: {})",
                meter.meter_type.as_str(),
                meter.serial,
                meter.meter_id
            );
            match fetch_interval_readings(&client, &meter, window, &FetchConfig::default()).await {
                Ok(fetched) => {
                    println!(
                        "    Retrieved {} records over {} pages ({} dropped).",
                        fetched.readings.len(),
                        fetched.pages,
                        fetched.dropped_records
                    );
                    for (day, total) in daily_totals(&fetched.readings) {
                        println!("      {day}: {total:.3} kWh");
                    }
                }
                Err(err) => println!("    Fetch failed: {err}"),
            }
        }
    }

    if let Some(credentials) = config.secondary.clone() {
        let timeout_ms = config.http_timeout_ms;
        let resource = tokio::task::spawn_blocking(move || {
            let glow = GlowmarktClient::new(credentials, timeout_ms)?;
            glow.consumption_resource_id()
        })
        .await?;
        match resource {
            Ok(Some(id)) => println!("Secondary consumption resource: {id}"),
            Ok(None) => println!("Secondary account has no electricity consumption resource."),
            Err(err) => println!("Secondary check failed: {err}"),
        }
    }

    Ok(())
}

fn daily_totals(readings: &[IntervalReading]) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for reading in readings {
        let Some(start) = Utc.timestamp_millis_opt(reading.start_ts_ms_utc).single() else {
            continue;
        };
        let day = start.with_timezone(&London).format("%Y-%m-%d").to_string();
        *out.entry(day).or_insert(0.0) += reading.value;
    }
    out
}
