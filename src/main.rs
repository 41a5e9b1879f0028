use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use proxy_finder::{
    config::{parse_secs, GeoPolicy, ScanConfig, ScanOverrides},
    logging::init_logging,
    proxy::{CandidateSource, CrawlerConfig, FileSource, ProxyCrawler},
    scan::{ScanController, ScanRun, ScanState},
    server,
    tui::ScanMonitorApp,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Discovers public proxies and validates which ones reach your targets
#[derive(Parser)]
#[command(name = "proxy-finder")]
#[command(about = "Discovers public proxies and validates which ones reach your targets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP control surface (default)
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:5000")]
        bind: String,
        /// Do not start a scan when the server starts
        #[arg(long)]
        no_autostart: bool,
    },
    /// Run one scan and exit
    Scan(ScanArgs),
    /// Only fetch candidates from the sources and print them
    Crawl {
        /// Output file for the candidates (one `host:port` per line)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Keep at most this many unique candidates
        #[arg(long)]
        max_proxies: Option<usize>,
        #[command(flatten)]
        sources: SourceArgs,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Extra local candidate list (can specify multiple)
    #[arg(short = 'f', long)]
    candidates_file: Vec<PathBuf>,
    /// Skip the built-in public sources
    #[arg(long)]
    no_common_sources: bool,
    /// Timeout in seconds for source requests
    #[arg(long, default_value = "15")]
    source_timeout: u64,
}

#[derive(Args)]
struct ScanArgs {
    /// Target URL (can specify multiple); overrides TARGET_URLS
    #[arg(short, long = "target")]
    targets: Vec<String>,
    /// Keep at most this many unique candidates
    #[arg(long)]
    max_proxies: Option<usize>,
    /// Concurrent probes per target
    #[arg(long)]
    max_per_target: Option<usize>,
    /// Concurrent probes overall
    #[arg(long)]
    max_workers: Option<usize>,
    /// Probe timeout in seconds
    #[arg(long, value_parser = parse_timeout)]
    timeout: Option<Duration>,
    /// Stop submitting probes after this many seconds
    #[arg(long)]
    budget: Option<u64>,
    /// Require working proxies to exit in this country (ISO code)
    #[arg(long)]
    verify_country: Option<String>,
    /// Result file
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Show the live terminal monitor
    #[arg(long)]
    tui: bool,
    #[command(flatten)]
    sources: SourceArgs,
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    parse_secs("--timeout", value).map_err(|e| e.to_string())
}

impl SourceArgs {
    fn crawler(&self) -> Result<ProxyCrawler> {
        let mut sources: Vec<Arc<dyn CandidateSource>> = if self.no_common_sources {
            Vec::new()
        } else {
            ProxyCrawler::common_sources()
        };
        for path in &self.candidates_file {
            sources.push(Arc::new(FileSource::new(path.clone())));
        }

        let config = CrawlerConfig::new().with_timeout(Duration::from_secs(self.source_timeout));
        Ok(ProxyCrawler::with_config(config, sources)?)
    }
}

impl ScanArgs {
    fn apply(&self, mut config: ScanConfig) -> ScanConfig {
        if !self.targets.is_empty() {
            config = config.with_targets(self.targets.iter().cloned());
        }
        if let Some(max) = self.max_proxies {
            config = config.with_max_candidates(Some(max));
        }
        if let Some(max) = self.max_per_target {
            config = config.with_max_per_target(max);
        }
        if let Some(max) = self.max_workers {
            config = config.with_max_workers(max);
        }
        if let Some(timeout) = self.timeout {
            config = config.with_probe_timeout(timeout);
        }
        if let Some(secs) = self.budget {
            config = config.with_scan_budget(Some(Duration::from_secs(secs)));
        }
        if let Some(country) = &self.verify_country {
            config = config.with_geo(GeoPolicy::enforce(country));
        }
        if let Some(output) = &self.output {
            config = config.with_output_file(output.clone());
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let quiet = matches!(&cli.command, Some(Commands::Scan(args)) if args.tui);
    init_logging(quiet);

    match cli.command {
        Some(Commands::Serve { bind, no_autostart }) => {
            serve(&bind, !no_autostart).await?;
        }
        None => {
            serve("0.0.0.0:5000", true).await?;
        }
        Some(Commands::Scan(args)) => {
            let config = args.apply(ScanConfig::from_env()?);
            let controller = ScanController::with_crawler(config, args.sources.crawler()?)?;

            let run = if args.tui {
                ScanMonitorApp::new(controller.clone())
                    .run(ScanOverrides::default())
                    .await?
            } else {
                controller.run_once(ScanOverrides::default()).await?
            };

            print_summary(&run, &controller).await;
            if run.state == ScanState::Failed {
                std::process::exit(1);
            }
        }
        Some(Commands::Crawl {
            output,
            max_proxies,
            sources,
        }) => {
            let crawler = sources.crawler()?;
            let report = crawler.fetch_candidates(max_proxies).await;

            for result in &report.sources {
                match &result.error {
                    None => eprintln!("Found {} proxies from {}", result.candidates.len(), result.source),
                    Some(error) => eprintln!("Error crawling {}: {}", result.source, error),
                }
            }
            eprintln!("Total unique proxies: {}", report.candidates.len());
            if report.truncated > 0 {
                eprintln!("Dropped {} over the limit", report.truncated);
            }

            let lines: Vec<String> = report.candidates.iter().map(|c| c.address()).collect();
            if let Some(output_path) = output {
                std::fs::write(&output_path, lines.join("\n") + "\n")?;
                eprintln!("Saved proxies to {:?}", output_path);
            } else {
                for line in &lines {
                    println!("{}", line);
                }
            }
        }
    }

    Ok(())
}

async fn serve(bind: &str, autostart: bool) -> Result<()> {
    let controller = ScanController::with_config(ScanConfig::from_env()?)?;
    server::serve(bind, controller, autostart).await
}

async fn print_summary(run: &ScanRun, controller: &ScanController) {
    if let Some(error) = &run.error {
        eprintln!("Scan failed: {}", error);
        return;
    }

    let working = controller.results().await;
    println!("Working proxies: {}", working.len());
    for proxy in &working {
        println!(
            "  {} via {} -> {} ({:.3}s)",
            proxy.proxy, proxy.scheme, proxy.target, proxy.latency
        );
    }
}
