//! Supervisor: command line, configuration, and the worker pool.
//!
//! [`run`] is the process entry point an engine binary calls from `main`. It
//! parses the command line, installs logging, loads [`Settings`], then runs
//! the control loop: the domain map and the OS-signal fan-out live on the
//! main thread's event loop, workers are started sequentially, and control
//! events reach them as cross-thread deferred calls. First worker failure
//! tears down whatever started and exits 1; SIGTERM/SIGINT drain the pool
//! and exit 0; SIGHUP rotates the log and reloads routes.

use std::cell::RefCell;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;
use log::{debug, error, info};

use crate::domainmap::DomainMap;
use crate::logger;
use crate::runtime::defer;
use crate::runtime::event_loop::EventLoop;
use crate::runtime::process_quit::ProcessQuit;
use crate::settings::Settings;
use crate::worker::{EngineFactory, WorkerConfig, WorkerHandle};

/// Used when `--config` is not passed.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/relayd/relayd.conf";

// Plenty for the main thread: its loop runs only control plumbing.
const MAIN_TIMERS_MAX: usize = 100;
// Quit and hup pipes plus the deferred-call wakeup.
const MAIN_SOCKETNOTIFIERS_MAX: usize = 3;

#[derive(Parser, Debug)]
#[command(name = "relayd-proxy", version, about = "Relayd proxy component.")]
struct Args {
    /// Config file.
    #[arg(long, value_name = "file")]
    config: Option<PathBuf>,

    /// File to log to.
    #[arg(long, value_name = "file")]
    logfile: Option<PathBuf>,

    /// Log level (default: 2).
    #[arg(long, value_name = "x")]
    loglevel: Option<u32>,

    /// Verbose output. Same as --loglevel=3.
    #[arg(long)]
    verbose: bool,

    /// Override ipc_prefix config option.
    #[arg(long = "ipc-prefix", value_name = "prefix")]
    ipc_prefix: Option<String>,

    /// Add route (overrides routes file).
    #[arg(long = "route", value_name = "line")]
    route: Vec<String>,

    /// Log update checks as debug level.
    #[arg(long = "quiet-check")]
    quiet_check: bool,
}

/// Runs the supervisor to completion and returns the process exit code:
/// 0 for normal termination, 1 for configuration or startup errors.
pub fn run<I, T>(argv: I, factory: Arc<dyn EngineFactory>) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = match Args::try_parse_from(argv) {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            return code;
        }
    };

    let level = if args.verbose {
        3
    } else {
        args.loglevel.unwrap_or(2)
    };
    // Stderr first so config errors are visible even if --logfile is bad.
    let _ = logger::init(logger::level_from_cli(level), None);
    if let Some(logfile) = &args.logfile {
        if let Err(e) = logger::init(logger::level_from_cli(level), Some(logfile)) {
            error!("failed to open log file {}: {}", logfile.display(), e);
            return 1;
        }
    }

    debug!("starting...");

    let config_file = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if args.config.is_none() && !config_file.exists() {
        error!(
            "failed to open {}, and --config not passed",
            config_file.display()
        );
        return 1;
    }

    let mut settings = match Settings::from_file(&config_file) {
        Ok(s) => s,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };
    settings.apply_ipc_prefix(args.ipc_prefix.as_deref());
    if let Err(e) = settings.validate() {
        error!("{}", e);
        return 1;
    }

    let config_dir = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let routes_file = settings.routes_file(config_dir);
    let worker_count = settings.proxy.workers;
    let sessions_max = settings.sessions_max();

    let p = settings.proxy;
    let base = WorkerConfig {
        id: 0,
        client_id: format!("proxy_{}", std::process::id()),
        sessions_max: sessions_max / worker_count,
        ipc_file_mode: p.ipc_file_mode,
        debug: p.debug,
        quiet_check: args.quiet_check,
        server_in_specs: p.server_in_specs,
        server_in_stream_specs: p.server_in_stream_specs,
        server_out_specs: p.server_out_specs,
        client_out_specs: p.client_out_specs,
        client_out_stream_specs: p.client_out_stream_specs,
        client_in_specs: p.client_in_specs,
        inspect_spec: p.inspect_spec,
        accept_spec: p.accept_spec,
        retry_in_spec: p.retry_in_spec,
        ws_control_init_specs: p.ws_control_init_specs,
        ws_control_stream_specs: p.ws_control_stream_specs,
        stats_spec: p.stats_spec,
        command_spec: p.command_spec,
        intreq_in_specs: p.intreq_in_specs,
        intreq_in_stream_specs: p.intreq_in_stream_specs,
        intreq_out_specs: p.intreq_out_specs,
    };

    let code = run_loop(base, &args.route, routes_file, worker_count, factory);
    defer::cleanup();
    code
}

fn build_domain_map(route_lines: &[String], routes_file: Option<PathBuf>) -> Option<DomainMap> {
    if !route_lines.is_empty() {
        let map = DomainMap::from_lines();
        for line in route_lines {
            if let Err(e) = map.add_route_line(line) {
                error!("{}", e);
                return None;
            }
        }
        Some(map)
    } else if let Some(path) = routes_file {
        if !path.exists() {
            error!("failed to open routes file: {}", path.display());
            return None;
        }
        let map = DomainMap::from_file(path);
        map.reload();
        Some(map)
    } else {
        Some(DomainMap::from_lines())
    }
}

fn run_loop(
    base: WorkerConfig,
    route_lines: &[String],
    routes_file: Option<PathBuf>,
    worker_count: usize,
    factory: Arc<dyn EngineFactory>,
) -> i32 {
    let l = match EventLoop::new(MAIN_TIMERS_MAX + MAIN_SOCKETNOTIFIERS_MAX) {
        Ok(l) => l,
        Err(e) => {
            error!("failed to create event loop: {}", e);
            return 1;
        }
    };
    defer::init_global();

    let domain_map = match build_domain_map(route_lines, routes_file) {
        Some(m) => Rc::new(m),
        None => return 1,
    };

    let workers: Rc<RefCell<Vec<WorkerHandle>>> = Rc::new(RefCell::new(Vec::new()));

    let _changed_conn = {
        let workers = workers.clone();
        domain_map.changed.connect(move || {
            for w in workers.borrow().iter() {
                w.routes_changed();
            }
        })
    };

    let pq = match ProcessQuit::new(&l) {
        Ok(pq) => pq,
        Err(e) => {
            error!("failed to install signal handlers: {}", e);
            return 1;
        }
    };

    let _quit_conn = {
        let workers = workers.clone();
        let pq_weak = Rc::downgrade(&pq);
        let l = l.clone();
        pq.quit.connect(move || {
            info!("stopping...");

            // Remove the handlers, so if we get another signal then we
            // crash out.
            if let Some(pq) = pq_weak.upgrade() {
                pq.cleanup();
            }

            for w in workers.borrow().iter() {
                w.stop();
            }
            workers.borrow_mut().clear();

            debug!("stopped");
            l.exit(0);
        })
    };

    let _hup_conn = {
        let domain_map = domain_map.clone();
        pq.hup.connect(move || {
            info!("reloading");
            logger::rotate();
            domain_map.reload();
        })
    };

    for n in 0..worker_count {
        let wconfig = base.for_worker(n, worker_count);
        match WorkerHandle::spawn(wconfig, domain_map.view(), factory.clone()) {
            Ok(w) => workers.borrow_mut().push(w),
            Err(e) => {
                error!("{}", e);
                workers.borrow_mut().clear();
                return 1;
            }
        }
    }

    info!("started");

    l.exec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(args).unwrap()
    }

    #[test]
    fn parses_all_flags() {
        let a = parse(&[
            "relayd-proxy",
            "--config=/tmp/x.conf",
            "--logfile=/tmp/x.log",
            "--loglevel=3",
            "--ipc-prefix=t-",
            "--route=* test",
            "--route=example.com other",
            "--quiet-check",
        ]);
        assert_eq!(a.config.as_deref(), Some(Path::new("/tmp/x.conf")));
        assert_eq!(a.loglevel, Some(3));
        assert_eq!(a.ipc_prefix.as_deref(), Some("t-"));
        assert_eq!(a.route.len(), 2);
        assert!(a.quiet_check);
    }

    #[test]
    fn verbose_overrides_loglevel() {
        let a = parse(&["relayd-proxy", "--verbose", "--loglevel=0"]);
        assert!(a.verbose);
        // run() resolves verbose to level 3 regardless of --loglevel.
        let level = if a.verbose { 3 } else { a.loglevel.unwrap_or(2) };
        assert_eq!(level, 3);
    }

    #[test]
    fn negative_loglevel_is_rejected() {
        assert!(Args::try_parse_from(["relayd-proxy", "--loglevel=-1"]).is_err());
    }

    #[test]
    fn help_and_version_are_not_errors() {
        for flag in ["--help", "--version"] {
            let e = Args::try_parse_from(["relayd-proxy", flag]).unwrap_err();
            assert!(matches!(
                e.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ));
        }
    }
}
