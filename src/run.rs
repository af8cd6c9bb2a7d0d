//! Top-level entry point: flag parsing, loading, and driving the build.

use crate::{
    fs::RealFileSystem,
    jobserver, load,
    progress::{DumbConsoleProgress, FancyConsoleProgress, Progress},
    signal, terminal, trace, work,
};
use anyhow::anyhow;
use argh::FromArgs;
use std::path::Path;

/// A load-phase failure; distinguished so the front end can exit 2 (manifest
/// or argument error) rather than 1 (build failure).
#[derive(Debug)]
struct ManifestError(anyhow::Error);

impl std::fmt::Display for ManifestError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ManifestError {}

struct BuildParams<'a> {
    options: work::Options,
    target_names: &'a [String],
    build_filename: &'a String,
}

/// Holds the build-directory lockfile for the duration of the build.
struct BuildLock {
    _file: std::fs::File,
}

#[cfg(unix)]
fn acquire_build_lock(build_dir: Option<&str>) -> anyhow::Result<BuildLock> {
    use std::os::fd::AsRawFd;
    let path = match build_dir {
        Some(dir) => Path::new(dir).join(".ninja_lock"),
        None => Path::new(".ninja_lock").to_owned(),
    };
    let file = std::fs::File::create(&path)
        .map_err(|err| anyhow!("create {}: {}", path.display(), err))?;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret < 0 {
        anyhow::bail!("another build is already running here");
    }
    Ok(BuildLock { _file: file })
}

#[cfg(not(unix))]
fn acquire_build_lock(build_dir: Option<&str>) -> anyhow::Result<BuildLock> {
    // CreateFile with no sharing would be the equivalent; elided.
    let path = match build_dir {
        Some(dir) => Path::new(dir).join(".ninja_lock"),
        None => Path::new(".ninja_lock").to_owned(),
    };
    let file = std::fs::File::create(path)?;
    Ok(BuildLock { _file: file })
}

fn new_work<'a>(
    state: &'a mut load::State,
    params: &'a BuildParams,
    progress: &'a mut dyn Progress,
    fs: &'a RealFileSystem,
) -> work::Work<'a> {
    work::Work::new(
        &mut state.graph,
        &mut state.build_log,
        &mut state.deps_log,
        &params.options,
        progress,
        state.pools.clone(),
        fs,
        jobserver::Client::from_env(),
    )
}

fn build(progress: &mut dyn Progress, params: &BuildParams) -> anyhow::Result<Option<usize>> {
    let fs = RealFileSystem::new();
    let mut state = trace::scope("load::read", || load::read(params.build_filename))
        .map_err(|err| anyhow::Error::new(ManifestError(err)))?;
    let _lock = acquire_build_lock(state.build_dir.as_deref())?;

    // Bring the manifest itself up to date first, and reload if that
    // changed it.
    let manifest_result = {
        let mut work = new_work(&mut state, params, progress, &fs);
        match work.is_build_target(params.build_filename) {
            None => Some(0),
            Some(target) => {
                work.want_fileid(target)?;
                trace::scope("work.run", || work.run())?
            }
        }
    };
    match manifest_result {
        None => return Ok(None),
        Some(0) => {}
        Some(_) => {
            state = trace::scope("load::read", || load::read(params.build_filename))
                .map_err(|err| anyhow::Error::new(ManifestError(err)))?;
        }
    }

    let defaults = state.default.clone();
    let mut work = new_work(&mut state, params, progress, &fs);
    if !params.target_names.is_empty() {
        for name in params.target_names {
            work.want_file(name)?;
        }
    } else if !defaults.is_empty() {
        for target in defaults {
            work.want_fileid(target)?;
        }
    } else {
        anyhow::bail!("no path specified and no default");
    }

    trace::scope("work.run", || work.run())
}

fn default_parallelism() -> anyhow::Result<usize> {
    // The reference tool uses processors plus a small constant; the
    // difference doesn't matter much.
    let par = std::thread::available_parallelism()?;
    Ok(usize::from(par))
}

#[derive(argh::FromArgs)] // this struct generates the flags and --help output
/// kiln, a ninja-compatible build system
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// input build file [default=build.ninja]
    #[argh(option, short = 'f', default = "(\"build.ninja\".into())")]
    build_file: String,

    /// debugging tools
    #[argh(option, short = 'd')]
    debug: Option<String>,

    /// subcommands
    #[argh(option, short = 't')]
    tool: Option<String>,

    /// parallelism [default uses system thread count]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// keep going until at least N failures (0 means infinity) [default=1]
    #[argh(option, short = 'k', default = "1")]
    keep_going: usize,

    /// dry run: compute the plan but run nothing
    #[argh(switch, short = 'n')]
    dry_run: bool,

    /// print version (required by cmake)
    #[argh(switch, hidden_help)]
    version: bool,

    /// print executed command lines
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// targets to build
    #[argh(positional)]
    targets: Vec<String>,
}

fn run_impl() -> anyhow::Result<i32> {
    let args: Vec<String> = std::env::args().collect();
    let fake_ninja_compat = Path::new(&args[0]).file_name().unwrap_or_default()
        == std::ffi::OsStr::new(&format!("ninja{}", std::env::consts::EXE_SUFFIX));

    let argv0 = args[0].as_str();
    let arg_refs: Vec<&str> = args.iter().skip(1).map(String::as_str).collect();
    let opts: Opts = match Opts::from_args(&[argv0], &arg_refs) {
        Ok(opts) => opts,
        Err(exit) => {
            if exit.status.is_ok() {
                println!("{}", exit.output);
                return Ok(0);
            }
            eprintln!("{}", exit.output);
            return Ok(2);
        }
    };

    if opts.version {
        if fake_ninja_compat {
            println!("1.10.2");
        } else {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
        return Ok(0);
    }

    if let Some(debug) = opts.debug {
        match debug.as_str() {
            "list" => {
                println!("debug tools:");
                println!("  trace  generate json performance trace");
                return Ok(1);
            }
            "trace" => trace::open("trace.json")?,
            _ => {
                println!("kiln: unknown -d {:?}, use -d list to list", debug);
                return Ok(2);
            }
        }
    }

    if let Some(tool) = opts.tool {
        match tool.as_str() {
            "list" => {
                println!("subcommands:");
                println!("  (none yet)");
                return Ok(1);
            }
            _ => {
                if fake_ninja_compat {
                    return Ok(0);
                }
                println!("kiln: unknown -t {:?}, use -t list to list", tool);
                return Ok(2);
            }
        }
    }

    if let Some(dir) = opts.chdir {
        let dir = Path::new(&dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    signal::register();

    let params = BuildParams {
        options: work::Options {
            parallelism: match opts.parallelism {
                Some(p) => p,
                None => default_parallelism()?,
            },
            failures_left: match opts.keep_going {
                0 => None,
                n => Some(n),
            },
            dry_run: opts.dry_run,
        },
        target_names: &opts.targets,
        build_filename: &opts.build_file,
    };

    let mut progress: Box<dyn Progress> = if terminal::use_fancy() {
        Box::new(FancyConsoleProgress::new(opts.verbose))
    } else {
        Box::new(DumbConsoleProgress::new(opts.verbose))
    };

    match build(progress.as_mut(), &params) {
        Ok(None) => {
            // The failing task's output is the diagnostic; no summary.
            if signal::was_interrupted() {
                Ok(130)
            } else {
                Ok(1)
            }
        }
        Ok(Some(0)) => {
            drop(progress);
            println!("kiln: no work to do");
            Ok(0)
        }
        Ok(Some(n)) => {
            drop(progress);
            println!(
                "kiln: ran {} task{}, now up to date",
                n,
                if n == 1 { "" } else { "s" }
            );
            Ok(0)
        }
        Err(err) => {
            drop(progress);
            println!("kiln: error: {}", err);
            if err.downcast_ref::<ManifestError>().is_some() {
                Ok(2)
            } else {
                Ok(1)
            }
        }
    }
}

pub fn run() -> anyhow::Result<i32> {
    let res = run_impl();
    let _ = trace::close();
    res
}
