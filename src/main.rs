use clap::{Parser, Subcommand};
use color_eyre::Result;
use hilan_headless::{
	config::{AppConfig, SettingsCommand, SettingsFlags},
	runner,
	webhook::{self, ServeArgs},
};
use tracing_subscriber::EnvFilter;
use v_utils::log;

#[derive(Parser)]
#[command(name = "hilan_headless")]
#[command(about = "Fill last month's Hilan attendance report and export it to Excel", long_about = None)]
struct Cli {
	#[command(subcommand)]
	command: Option<Command>,

	#[command(flatten)]
	settings: SettingsFlags,
}

#[derive(Subcommand)]
enum Command {
	/// Run one automation pass (the default)
	Run,
	/// Serve the webhook API that triggers runs
	Serve(ServeArgs),
	/// Manage the config file
	#[command(subcommand)]
	Config(SettingsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();

	let cli = Cli::parse();
	match cli.command {
		None | Some(Command::Run) => {
			let config = AppConfig::load(cli.settings)?;
			log!("Starting Hilan automation...");
			let report = runner::run(&config).await?;

			// The webhook server parses this line out of the child's stdout
			println!("{}", report.to_line());
			log!("{report}");
		}
		Some(Command::Serve(args)) => {
			let forwarded = cli.settings.forwarded_args();
			// Credentials are only needed by the child runs
			let config = AppConfig::try_build(cli.settings)?;
			webhook::serve(args, config.downloads_dir, forwarded).await?
		}
		Some(Command::Config(cmd)) => AppConfig::handle_settings_command(cmd, cli.settings),
	}
	Ok(())
}
