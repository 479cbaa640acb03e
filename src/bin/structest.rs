//! structest - Driver Probe CLI
//!
//! Materializes one image with the selected driver, performs a single
//! operation, and tears the driver down again.
//!
//! ## Usage
//!
//! ```sh
//! structest <driver> <image> exec [-e KEY=VALUE]... -- <cmd> [args...]
//! structest <driver> <image> stat <path>
//! structest <driver> <image> cat <path>
//! structest <driver> <image> ls <path>
//! ```
//!
//! `<driver>` is `docker` (alias `runtime`) or `tar` (alias `archive`). For
//! `tar`, `<image>` is the path of an image archive on the host.
//!
//! Log verbosity comes from `STRUCTEST_LOG` (default `warn`).

use std::io::Write;
use std::process::ExitCode;
use structest::{Command, DriverGuard, ENV_LOG, EnvVar, FileInfo, init_driver_impl};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Operation {
    Exec { env: Vec<EnvVar>, command: Command },
    Stat { path: String },
    Cat { path: String },
    Ls { path: String },
}

#[derive(Debug)]
struct Invocation {
    driver: String,
    image: String,
    operation: Operation,
}

fn parse_args(args: &[String]) -> Result<Invocation, String> {
    if args.len() < 4 {
        return Err("expected <driver> <image> <operation>".to_string());
    }
    let driver = args[1].clone();
    let image = args[2].clone();
    let rest = &args[4..];

    let path_arg = |op: &str| -> Result<String, String> {
        match rest {
            [path] => Ok(path.clone()),
            _ => Err(format!("{} requires exactly one <path>", op)),
        }
    };

    let operation = match args[3].as_str() {
        "exec" => {
            let mut env = Vec::new();
            let mut i = 0;
            while i < rest.len() {
                match rest[i].as_str() {
                    "-e" | "--env" => {
                        let assignment = rest
                            .get(i + 1)
                            .ok_or_else(|| "-e requires KEY=VALUE".to_string())?;
                        let var = EnvVar::parse(assignment)
                            .ok_or_else(|| format!("invalid env assignment '{}'", assignment))?;
                        env.push(var);
                        i += 2;
                    }
                    "--" => {
                        i += 1;
                        break;
                    }
                    other => return Err(format!("unexpected argument '{}' (missing --?)", other)),
                }
            }
            let command = Command::from(rest[i..].to_vec());
            if command.is_empty() {
                return Err("exec requires a command after --".to_string());
            }
            Operation::Exec { env, command }
        }
        "stat" => Operation::Stat {
            path: path_arg("stat")?,
        },
        "cat" => Operation::Cat {
            path: path_arg("cat")?,
        },
        "ls" => Operation::Ls {
            path: path_arg("ls")?,
        },
        other => return Err(format!("unknown operation '{}'", other)),
    };

    Ok(Invocation {
        driver,
        image,
        operation,
    })
}

fn log_level() -> Level {
    match std::env::var(ENV_LOG)
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "error" => Level::ERROR,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::WARN,
    }
}

fn print_help() {
    eprintln!(
        r#"structest - probe a container image through a structure-test driver

USAGE:
    structest <driver> <image> exec [-e KEY=VALUE]... -- <cmd> [args...]
    structest <driver> <image> stat <path>
    structest <driver> <image> cat <path>
    structest <driver> <image> ls <path>

DRIVERS:
    docker, runtime    Run the image as a container
    tar, archive       Extract an image archive (docker save / OCI layout / rootfs tar)

ENVIRONMENT:
    STRUCTEST_LOG              Log level (error, warn, info, debug, trace)
    STRUCTEST_CONFIG           YAML driver config file
    STRUCTEST_DOCKER_BINARY    Container CLI (default: docker)
    STRUCTEST_TAR_EXEC_MODE    auto, chroot or host
    STRUCTEST_TMPDIR           Parent directory for extracted images
"#
    );
}

// =============================================================================
// Operations
// =============================================================================

fn format_info(info: &FileInfo) -> String {
    format!(
        "{} {:>10} {} {}",
        info.permissions(),
        info.size,
        info.modified.format("%Y-%m-%d %H:%M"),
        info.name
    )
}

/// Maps a command's exit code to ours; codes that do not fit are failures.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

/// Runs the operation and returns the process exit status.
async fn run(driver: &DriverGuard, operation: Operation) -> structest::Result<u8> {
    match operation {
        Operation::Exec { env, command } => {
            let result = driver.process_command(&env, &command).await?;
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            Ok(exit_status(result.exit_code))
        }
        Operation::Stat { path } => {
            println!("{}", format_info(&driver.stat_file(&path).await?));
            Ok(0)
        }
        Operation::Cat { path } => {
            let data = driver.read_file(&path).await?;
            std::io::stdout().write_all(&data)?;
            Ok(0)
        }
        Operation::Ls { path } => {
            for info in driver.read_dir(&path).await? {
                println!("{}", format_info(&info));
            }
            Ok(0)
        }
    }
}

async fn probe(invocation: Invocation) -> structest::Result<u8> {
    let ctor = init_driver_impl(&invocation.driver)
        .ok_or_else(|| structest::Error::UnknownDriver(invocation.driver.clone()))?;
    let mut driver = DriverGuard::new(ctor(&invocation.image)?);

    let outcome = match driver.setup(&[], &[]).await {
        Ok(()) => run(&driver, invocation.operation).await,
        Err(e) => Err(e),
    };
    // Cleanup failures are logged by the guard and do not change the result.
    let _ = driver.release().await;
    outcome
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level())
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to set tracing subscriber");
    }

    let args: Vec<String> = std::env::args().collect();
    if matches!(args.get(1).map(String::as_str), Some("-h" | "--help" | "help")) {
        print_help();
        return ExitCode::SUCCESS;
    }

    let invocation = match parse_args(&args) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("error: {}", e);
            print_help();
            return ExitCode::from(2);
        }
    };

    match probe(invocation).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(s: &str) -> Vec<String> {
        std::iter::once("structest")
            .chain(s.split_whitespace())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_exec() {
        let inv = parse_args(&argv("tar img.tar exec -e A=1 -e B=x=y -- sh -c true")).unwrap();
        assert_eq!(inv.driver, "tar");
        match inv.operation {
            Operation::Exec { env, command } => {
                assert_eq!(env, vec![EnvVar::new("A", "1"), EnvVar::new("B", "x=y")]);
                assert_eq!(command.parts(), ["sh", "-c", "true"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&argv("docker alpine")).is_err());
        assert!(parse_args(&argv("docker alpine exec --")).is_err());
        assert!(parse_args(&argv("docker alpine exec ls")).is_err());
        assert!(parse_args(&argv("docker alpine stat")).is_err());
        assert!(parse_args(&argv("docker alpine chmod /x")).is_err());
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(3), 3);
        assert_eq!(exit_status(137), 137);
        assert_eq!(exit_status(-1), 1);
        assert_eq!(exit_status(256), 1);
    }

    #[test]
    fn test_parse_path_ops() {
        let inv = parse_args(&argv("docker alpine ls /etc")).unwrap();
        assert!(matches!(inv.operation, Operation::Ls { path } if path == "/etc"));
    }
}
