use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use game_vision::driver::{DomElement, DomSummary, MockBrowser, RetryPolicy, labeled_frame};
use game_vision::runloop::{RunConfig, TestRunLoop};
use game_vision::session::{Session, cleanup_old_sessions, list_sessions};
use game_vision::vision::{ScriptedOracle, check_health};

/// Game Vision - automated browser game playability probing
#[derive(Parser, Debug)]
#[command(
    name = "game-vision",
    about = "Probe browser games for playability with screenshot fingerprinting and vision analysis",
    after_help = "ENVIRONMENT VARIABLES:\n\
        GAME_VISION_VLM_ENDPOINT   VLM API endpoint URL\n\
        GAME_VISION_VLM_MODEL      VLM model name\n\
        GAME_VISION_SESSION_DIR    Base directory for sessions\n\
        GAME_VISION_MAX_ACTIONS    Default action budget per run\n\
        GAME_VISION_MAX_DURATION   Default run budget (seconds)"
)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the probe loop against a built-in simulated game
    Simulate {
        /// Scenario: clicker, keyboard, dead, or crash
        #[arg(short, long, default_value = "clicker")]
        scenario: String,

        /// Action budget for the run
        #[arg(short, long, env = "GAME_VISION_MAX_ACTIONS", default_value = "20")]
        actions: usize,

        /// Wall-clock budget in seconds
        #[arg(short, long, env = "GAME_VISION_MAX_DURATION", default_value = "60")]
        duration: u64,

        /// Hint about the simulated game's controls, forwarded to the oracle
        #[arg(long)]
        hint: Option<String>,

        /// Output directory for evidence (default: auto-generated in session dir)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep evidence after completion (default: cleanup unless --output is specified)
        #[arg(long, short = 'k')]
        keep: bool,

        /// Output the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check whether the configured VLM endpoint is reachable
    VlmCheck {
        /// VLM endpoint URL
        #[arg(long, env = "GAME_VISION_VLM_ENDPOINT", default_value = "http://127.0.0.1:8080/v1/chat/completions")]
        endpoint: String,

        /// Connection timeout in seconds
        #[arg(long, default_value = "5")]
        timeout: u64,
    },

    /// List or clean up evidence sessions
    Sessions {
        /// Remove sessions older than this many hours instead of listing
        #[arg(long)]
        clean_older_than: Option<u64>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    match args.command {
        Some(Commands::Simulate {
            scenario,
            actions,
            duration,
            hint,
            output,
            keep,
            json,
        }) => {
            let session = if let Some(ref dir) = output {
                Session::in_dir(dir).keep(true)
            } else {
                Session::with_name(&format!("simulate_{}", scenario)).keep(keep)
            };
            let evidence_dir = session.dir.clone();

            let driver = build_scenario(&scenario)
                .ok_or_else(|| format!("Unknown scenario '{}'. Use: clicker, keyboard, dead, crash", scenario))?;
            // Simulations run offline; the heuristic layer carries the
            // decisions and oracle calls fail through cleanly.
            let oracle = ScriptedOracle::new([]);

            let mut config = RunConfig::new(format!("https://simulated.test/{}", scenario))
                .max_actions(actions)
                .max_duration(Duration::from_secs(duration))
                .settle_delay(Duration::from_millis(10))
                .wait_delay(Duration::from_millis(50))
                .navigation_retry(RetryPolicy::immediate(3));
            if let Some(hint) = hint {
                config = config.input_hint(hint);
            }

            let report = TestRunLoop::new(driver, oracle, session, config).run();

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Scenario:  {}", scenario);
                println!("Terminal:  {}", report.terminal_state);
                println!(
                    "Actions:   {} ({} changed the screen)",
                    report.actions.len(),
                    report.actions.iter().filter(|a| a.changed).count()
                );
                println!("Score:     {:.0}/100", report.metrics.progress_score);
                println!("Recovery:  {} attempts", report.unstick_log.len());
                if let Some(error) = &report.error {
                    println!("Error:     {}", error);
                }
                if keep || output.is_some() {
                    println!("Evidence:  {}", evidence_dir.display());
                }
            }

            if !report.success() {
                std::process::exit(1);
            }
        }

        Some(Commands::VlmCheck { endpoint, timeout }) => {
            match check_health(&endpoint, timeout)? {
                true => println!("VLM endpoint reachable: {}", endpoint),
                false => {
                    eprintln!("VLM endpoint unreachable: {}", endpoint);
                    std::process::exit(1);
                }
            }
        }

        Some(Commands::Sessions { clean_older_than }) => {
            if let Some(hours) = clean_older_than {
                let cleaned = cleanup_old_sessions(Duration::from_secs(hours * 3600))?;
                println!("Removed {} session(s) older than {}h", cleaned, hours);
            } else {
                let sessions = list_sessions()?;
                if sessions.is_empty() {
                    println!("No sessions found");
                } else {
                    for path in sessions {
                        println!("{}", path.display());
                    }
                }
            }
        }

        None => {
            eprintln!("No command specified. Use --help for usage.");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Build the scripted browser for a named scenario.
fn build_scenario(name: &str) -> Option<MockBrowser> {
    let frames: Vec<Vec<u8>> = (0..24)
        .map(|i| labeled_frame(&format!("screen {}", i), [(i * 10) as u8, 40, 80]))
        .collect();

    let viewport = DomSummary {
        viewport_width: 800.0,
        viewport_height: 600.0,
        ..Default::default()
    };

    match name {
        "clicker" => Some(
            MockBrowser::new()
                .frames(frames)
                .dom(DomSummary {
                    title: "Simulated Cookie Clicker".to_string(),
                    ..viewport
                })
                .advance_on_click(true),
        ),
        "keyboard" => Some(
            MockBrowser::new()
                .frames(frames)
                .dom(DomSummary {
                    title: "Simulated Key Game".to_string(),
                    elements: vec![DomElement {
                        tag: "canvas".to_string(),
                        text: String::new(),
                        x: 0.0,
                        y: 0.0,
                        width: 800.0,
                        height: 600.0,
                        visible: true,
                        clickable: true,
                    }],
                    ..viewport
                })
                .advance_on_keys(["Space"]),
        ),
        "dead" => Some(MockBrowser::new().dom(DomSummary {
            title: "Simulated Frozen Game".to_string(),
            ..viewport
        })),
        "crash" => Some(MockBrowser::new().dom(DomSummary {
            title: "Simulated Broken Game".to_string(),
            console_errors: vec![
                "Uncaught ReferenceError: engine is not defined".to_string(),
            ],
            ..viewport
        })),
        _ => None,
    }
}
