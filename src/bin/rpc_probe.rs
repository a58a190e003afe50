use std::{sync::Arc, time::Instant};

use anyhow::{Context, Result};
use ironconnect::{
    config::Config,
    domain::chain_config::NetworkId,
    infrastructure::logging::init_logging,
    service::chain_adapter::wei_to_gwei,
    utils::{chain_normalizer::normalize_network, time_utils::format_duration},
    AppState,
};

#[derive(Debug)]
struct ProbeResult {
    network: NetworkId,
    ok: bool,
    elapsed_ms: u128,
    detail: String,
}

struct Args {
    config: Option<String>,
    networks: Vec<String>,
}

fn parse_args() -> Args {
    let mut parsed = Args {
        config: None,
        networks: Vec::new(),
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => parsed.config = args.next(),
            "--network" => {
                if let Some(v) = args.next() {
                    parsed.networks.push(v);
                }
            }
            _ => {}
        }
    }

    parsed
}

async fn probe(state: &AppState, network: NetworkId) -> ProbeResult {
    let started = Instant::now();
    let connection = state.manager.connect_rpc(network).await;
    let elapsed_ms = started.elapsed().as_millis();

    if let Some(cause) = connection.error() {
        return ProbeResult {
            network,
            ok: false,
            elapsed_ms,
            detail: format!("{} ({})", cause.user_message(), cause.code()),
        };
    }

    let Some(adapter) = state.manager.active_adapter() else {
        return ProbeResult {
            network,
            ok: false,
            elapsed_ms,
            detail: "connected without adapter".to_string(),
        };
    };

    let block = adapter.get_block_number().await;
    let fees = adapter.get_fee_data().await;
    let detail = match (block, fees) {
        (Ok(block), Ok(fees)) => {
            let price = fees
                .max_fee_per_gas
                .or(fees.gas_price)
                .map(wei_to_gwei)
                .unwrap_or_default();
            format!(
                "chain_id={} block={} fee={:.2} gwei eta~{}",
                connection.chain_id().unwrap_or_default(),
                block,
                price,
                format_duration(adapter.estimate_confirmation_time(price).as_secs())
            )
        }
        (Err(e), _) | (_, Err(e)) => {
            return ProbeResult {
                network,
                ok: false,
                elapsed_ms,
                detail: e.user_message(),
            }
        }
    };

    ProbeResult {
        network,
        ok: true,
        elapsed_ms,
        detail,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    let config = Config::from_env_and_file(args.config.as_deref())?;
    if let Err(e) = init_logging(&config.logging) {
        eprintln!("logging already initialized: {}", e);
    }

    let state = AppState::new(Arc::new(config), None)
        .await
        .context("build application state")?;

    let targets: Vec<NetworkId> = if args.networks.is_empty() {
        state.networks.list_all().iter().map(|n| n.id).collect()
    } else {
        args.networks
            .iter()
            .map(|alias| normalize_network(alias))
            .collect::<Result<_, _>>()?
    };

    let mut results = Vec::with_capacity(targets.len());
    for network in targets {
        results.push(probe(&state, network).await);
    }
    state.shutdown().await;

    println!("RPC connectivity probe ({} networks)", results.len());
    let mut failures = 0usize;
    for r in &results {
        if r.ok {
            println!("[OK]   {:10} {:>6}ms {}", r.network.as_str(), r.elapsed_ms, r.detail);
        } else {
            failures += 1;
            println!("[FAIL] {:10} {:>6}ms {}", r.network.as_str(), r.elapsed_ms, r.detail);
        }
    }

    if failures > 0 {
        anyhow::bail!("{} networks unreachable", failures);
    }

    Ok(())
}
