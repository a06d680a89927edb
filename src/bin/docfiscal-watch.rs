// DocFiscal Payment Watcher
// "Wait for the money, then tell the shell"

use clap::{Arg, Command};
use docfiscal::circuit_breaker::CircuitBreaker;
use docfiscal::error::recovery::RecoveryDependencies;
use docfiscal::error::ErrorContext;
use docfiscal::logging::bootstrap_subscriber;
use docfiscal::service::{HttpDocFiscalClient, PaymentStatus, SharedService};
use docfiscal::{
    init_logging, Config, DocFiscalResult, ErrorLogger, ErrorRecoveryManager, GlobalErrorHandler,
    PaymentStatusPoller, PollerState,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug)]
struct CliArgs {
    base_url: String,
    payment_id: String,
    config_file: Option<String>,
    token: Option<String>,
}

fn parse_cli_args() -> CliArgs {
    let matches = Command::new("docfiscal-watch")
        .version(VERSION)
        .about("Poll a DocFiscal payment until it settles")
        .long_about(
            "Polls the payment status route with exponential backoff until the payment\n\
             is paid, failed, cancelled or expired. Exits 0 when paid, 1 otherwise.",
        )
        .arg(
            Arg::new("base-url")
                .long("base-url")
                .value_name("URL")
                .env("DOCFISCAL_API__BASE_URL")
                .required(true)
                .help("Base URL of the DocFiscal application"),
        )
        .arg(
            Arg::new("payment-id")
                .long("payment-id")
                .value_name("ID")
                .required(true)
                .help("Payment to watch"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("token")
                .long("token")
                .value_name("TOKEN")
                .env("DOCFISCAL_API__TOKEN")
                .hide_env_values(true)
                .help("Bearer token for the API"),
        )
        .get_matches();

    CliArgs {
        base_url: matches
            .get_one::<String>("base-url")
            .cloned()
            .unwrap_or_default(),
        payment_id: matches
            .get_one::<String>("payment-id")
            .cloned()
            .unwrap_or_default(),
        config_file: matches.get_one::<String>("config").cloned(),
        token: matches.get_one::<String>("token").cloned(),
    }
}

fn load_config(args: &CliArgs) -> DocFiscalResult<Config> {
    let mut config = Config::load_with_file(args.config_file.as_deref())?;
    config.api.base_url = args.base_url.clone();
    if args.token.is_some() {
        config.api.token = args.token.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn watch(config: Config, payment_id: String) -> DocFiscalResult<PollerState> {
    let storage = config.persistence.storage();
    let logger = Arc::new(ErrorLogger::with_capacity(
        storage,
        config.error_log.capacity,
    ));
    let recovery = ErrorRecoveryManager::create(RecoveryDependencies::default());
    let handler = Arc::new(GlobalErrorHandler::new(Arc::clone(&logger), recovery));
    handler.install_panic_hook();

    let breaker = Arc::new(CircuitBreaker::new(
        "docfiscal-api",
        config.circuit_breaker.breaker_config(),
    ));
    let service: SharedService = Arc::new(
        HttpDocFiscalClient::from_config(&config.api)?.with_circuit_breaker(breaker),
    );

    let error_logger = Arc::clone(&logger);
    let error_payment_id = payment_id.clone();
    let poller = PaymentStatusPoller::builder(payment_id.clone(), service)
        .config(config.poller.poller_config())
        .on_status_change(|response| {
            info!(status = %response.status, "📬 Payment status");
        })
        .on_error(move |error| {
            let mut context = ErrorContext::new();
            context.insert("payment_id".to_string(), error_payment_id.clone().into());
            error_logger.log_error(error, context);
        })
        .build();

    poller.start_polling();
    let state = tokio::select! {
        state = poller.wait_until_settled() => state,
        _ = tokio::signal::ctrl_c() => {
            warn!("🛑 Interrupted, stopping payment polling");
            poller.stop_polling();
            PollerState::Idle
        }
    };

    match (state, poller.last_status()) {
        (PollerState::Completed, _) => info!(payment_id = %payment_id, "✅ Payment confirmed"),
        (state, Some(PaymentStatus::Pending) | None) => {
            warn!(payment_id = %payment_id, ?state, "⚠️ Payment did not settle")
        }
        (state, Some(status)) => {
            warn!(payment_id = %payment_id, ?state, %status, "❌ Payment not completed")
        }
    }
    Ok(state)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = parse_cli_args();

    // The configured subscriber depends on the config, so loading logs
    // through a scoped bootstrap one
    let loaded = tracing::subscriber::with_default(bootstrap_subscriber(), || {
        load_config(&args).inspect_err(|e| error!("❌ Failed to load configuration: {e}"))
    });
    let Ok(config) = loaded else {
        return ExitCode::FAILURE;
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("docfiscal-watch: {e}");
        return ExitCode::FAILURE;
    }

    info!(payment_id = %args.payment_id, base_url = %config.api.base_url, "🔭 Watching payment");
    match watch(config, args.payment_id).await {
        Ok(PollerState::Completed) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!(kind = %e.kind, "💥 {}", e.user_message());
            ExitCode::FAILURE
        }
    }
}
