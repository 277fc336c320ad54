use std::sync::Arc;

use chainfl::{
    activity::ActivityOutcome,
    core::{
        HospitalSummary,
        SystemClock,
    },
    logging,
    spawn_countdown,
    ActivityLog,
    AutoTrainConfig,
    ConsentController,
    ConsentPolicy,
    ConsoleSettings,
    FakeLedgerClient,
    HospitalId,
    HttpLedgerClient,
    PatientId,
    RemoteLedgerClient,
    RoundScheduler,
};
use tokio::io::{
    AsyncBufReadExt,
    BufReader,
};
use tracing::{
    error,
    info,
    warn,
};

const DEFAULT_PATIENT: &str = "P-1001";

struct Args {
    offline: bool,
    patient: String,
}

fn parse_args() -> Args {
    let mut args = Args { offline: false, patient: DEFAULT_PATIENT.to_string() };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--offline" => args.offline = true,
            "--patient" => {
                if let Some(patient) = iter.next() {
                    args.patient = patient;
                }
            }
            other => warn!(argument = other, "Ignoring unknown argument"),
        }
    }
    args
}

fn demo_ledger() -> FakeLedgerClient {
    let hospitals = [
        ("H1", "District Hospital Pune", "Pune"),
        ("H2", "Civil Hospital Nashik", "Nashik"),
        ("H3", "General Hospital Nagpur", "Nagpur"),
    ]
    .into_iter()
    .map(|(id, name, district)| HospitalSummary {
        hospital_id: HospitalId::new(id),
        name: name.to_string(),
        district: district.to_string(),
        state: "Maharashtra".to_string(),
    })
    .collect();

    FakeLedgerClient::new()
        .with_hospitals(hospitals)
        .with_accuracies(&[0.62, 0.71, 0.78, 0.84, 0.89, 0.93, 0.96])
}

async fn read_code() -> Result<String, std::io::Error> {
    println!("Enter the OTP delivered to the patient:");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line.trim().to_string())
}

async fn run(settings: ConsoleSettings, args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let fake = args.offline.then(|| Arc::new(demo_ledger()));
    let client: Arc<dyn RemoteLedgerClient> = match &fake {
        Some(fake) => Arc::clone(fake) as Arc<dyn RemoteLedgerClient>,
        None => Arc::new(HttpLedgerClient::from_settings(&settings)?),
    };
    let log = ActivityLog::new();

    let scheduler = Arc::new(RoundScheduler::new(client.clone(), Arc::new(log.clone())));
    let consent = Arc::new(ConsentController::new(
        client,
        Arc::new(log.clone()),
        Arc::new(SystemClock),
        ConsentPolicy::from_settings(&settings),
    ));

    let (hospitals, metrics) =
        futures::future::join(scheduler.verified_hospitals(), scheduler.current_metrics()).await;
    let hospitals = hospitals?;
    match metrics {
        Ok(metrics) => {
            info!(round = metrics.round, accuracy = metrics.metrics.accuracy, "Aggregator reachable")
        }
        Err(e) => warn!(error = %e, "Could not read current metrics"),
    }
    if hospitals.is_empty() {
        return Err("no verified hospitals available for training".into());
    }
    for hospital in &hospitals {
        println!(
            "{:<6} {:<28} {}, {}",
            hospital.hospital_id.as_str(),
            hospital.name,
            hospital.district,
            hospital.state
        );
    }

    scheduler.select_hospitals(hospitals.iter().map(|h| h.hospital_id.clone()))?;
    let config =
        AutoTrainConfig::new(settings.default_max_rounds, settings.default_accuracy_threshold);
    let summary = scheduler.start_auto_training(config)?.join().await??;
    info!(rounds = summary.rounds_executed, stop = ?summary.stop, "Training finished");

    println!("\n{:>5} {:>9} {:>9} {:>8} {:>10}", "round", "accuracy", "f1", "loss", "delta");
    for record in scheduler.history() {
        println!(
            "{:>5} {:>8.2}% {:>8.2}% {:>8.4} {:>+9.2}%",
            record.round,
            record.metrics.accuracy * 100.0,
            record.metrics.f1_score * 100.0,
            record.metrics.loss,
            record.improvement.accuracy * 100.0
        );
    }

    let patient = PatientId::new(args.patient);
    let hospital = hospitals[0].hospital_id.clone();
    let snapshot = consent.request_otp(&patient, &hospital).await?;
    info!(phase = ?snapshot.phase, expires_in = snapshot.time_remaining_secs, "Waiting for OTP");

    let countdown = spawn_countdown(consent.clone(), settings.countdown_tick());
    let code = match fake.as_ref().and_then(|fake| fake.issued_code(&patient, &hospital)) {
        Some(code) => Ok(code),
        None => read_code().await,
    };
    let granted: Result<_, Box<dyn std::error::Error>> = match code {
        Ok(code) => consent.verify_and_grant(&patient, &hospital, &code).await.map_err(Into::into),
        Err(e) => Err(e.into()),
    };
    countdown.cancel();
    if let Err(e) = countdown.join().await {
        warn!(error = %e, "OTP countdown did not shut down cleanly");
    }
    let receipt = granted?;
    println!("\nConsent recorded on ledger: {}", receipt.transaction_ref);

    println!("\nActivity:");
    for event in log.entries().iter().rev() {
        let marker = match event.outcome {
            ActivityOutcome::Success => "+",
            ActivityOutcome::Error => "!",
            ActivityOutcome::Info => "-",
        };
        println!("{} {} {}", event.timestamp.format("%H:%M:%S"), marker, event.message());
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = logging::init() {
        eprintln!("{e}");
    }

    let args = parse_args();
    let settings = ConsoleSettings::load();
    info!(api = %settings.api_base_url, offline = args.offline, "Starting ChainFL console");

    if let Err(e) = run(settings, args).await {
        error!("{e}");
        std::process::exit(1);
    }
}
