use clap::Parser;
use tracing::{error, info};
use usrp_record::{
    args::{convert_filter, Cli, Command},
    calibration::run_tune,
    device::RoutingTable,
    plan::AcquisitionPlan,
    record::run_record,
    sim::SimRadio,
    Error, Result,
};

/// Exit status for help output and every failure
const FAILURE: i32 = 255;

fn open_radio(plan: &AcquisitionPlan) -> Result<SimRadio> {
    match plan.device.get("type") {
        Some("sim") => SimRadio::from_args(&plan.device),
        other => Err(Error::Driver(format!(
            "no hardware driver for device type '{}' (only type=sim is built in)",
            other.unwrap_or_default()
        ))),
    }
}

fn run(command: Command) -> Result<()> {
    let table = RoutingTable::builtin()?;
    let plan = AcquisitionPlan::from_options(&command.options(), &table)?;
    let sweep = command.sweep()?;
    let mut radio = open_radio(&plan)?;
    let mut clock = radio.clock();
    match sweep {
        None => {
            let rec = run_record(&mut radio, &mut clock, &plan, &table)?;
            info!(
                "Recorded {} samples per channel ({} bytes total)",
                rec.summary.samples,
                rec.bytes.iter().sum::<u64>()
            );
        }
        Some(sweep) => {
            let report = run_tune(&mut radio, &mut clock, &plan, &sweep, &table)?;
            info!(
                "Swept {} gains ({} bytes total)",
                report.steps.len(),
                report.bytes.iter().sum::<u64>()
            );
        }
    }
    Ok(())
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version land here too
            let _ = e.print();
            std::process::exit(FAILURE);
        }
    };
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(cli.verbose.log_level_filter()))
        .init();
    info!("Starting {}", env!("CARGO_PKG_NAME"));
    if let Err(e) = run(cli.command) {
        error!("{e}");
        std::process::exit(FAILURE);
    }
}
