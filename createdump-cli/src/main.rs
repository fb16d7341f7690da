// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Writes a core dump and, on request, a crash report of a running process.
//!
//! `createdump [options] <pid>`
//!
//! `-f <template>` names the dump file. `%p`/`%d` expand to the pid, `%e` to
//! the executable name, `%h` to the host name, `%t` to the unix time and
//! `%%` to a literal percent. The default is `/tmp/coredump.%p`.
//!

#![cfg(target_os = "linux")]

use anyhow::Context;
use createdump::dac::NoDataAccess;
use createdump::platform::linux::LinuxInspector;
use createdump::unwind::FramePointerUnwinder;
use createdump::AppModel;
use createdump::CreateDumpOptions;
use createdump::DumpOutcome;
use createdump::DumpType;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use tracing::Level;

const DEFAULT_TEMPLATE: &str = "/tmp/coredump.%p";

const USAGE: &str = "\
Usage: createdump [options] pid
-f, --name - dump path and file name. The default is '/tmp/coredump.%p'. These specifiers are substituted with following values:
   %p  PID of dumped process.
   %e  The process executable filename.
   %h  Hostname return by gethostname().
   %t  Time of dump, expressed as seconds since the Epoch, 1970-01-01 00:00:00 +0000 (UTC).
-n, --normal - create minidump.
-h, --withheap - create minidump with heap (default).
-t, --triage - create triage minidump.
-u, --full - create full core dump.
-d, --diag - enable diagnostic messages.
--crashreport - write crash report file (dump file path + .crashreport.json).
--crashreportonly - write crash report file only (no dump).
--crashthread <id> - the thread id of the crashing thread.
--signal <code> - the signal code of the crash.
--code <code> - the signal si_code of the crash.
--errno <errno> - the errno of the crash.
--address <addr> - the faulting address of the crash, decimal or 0x hex.
--fastheaps - coarse enumeration of runtime memory for heap dumps.
--singlefile - enable single-file app check.
--nativeaot - the target is a NativeAOT app.
--logtofile <path> - writes diagnostic messages to the file.
--wait - print the pid and wait for a line on stdin before dumping.";

/// Parsed command line.
struct Args {
    options: CreateDumpOptions,
    template: String,
    wait: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut options = CreateDumpOptions::default();
    let mut template = None;
    let mut wait = false;
    let mut pid = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-f" | "--name" => template = Some(args.next().context("missing dump file name")?),
            "-n" | "--normal" => options.dump_type = DumpType::Mini,
            "-h" | "--withheap" => options.dump_type = DumpType::Heap,
            "-t" | "--triage" => options.dump_type = DumpType::Triage,
            "-u" | "--full" => options.dump_type = DumpType::Full,
            "--crashreport" => options.crash_report = true,
            "--crashreportonly" => options.crash_report_only = true,
            "--crashthread" => {
                let tid = args.next().context("missing crash thread id")?;
                options.crash_thread = Some(tid.parse().context("failed to parse crash thread id")?);
            }
            "--signal" => {
                let signal = args.next().context("missing signal")?;
                options.signal = signal.parse().context("failed to parse signal")?;
            }
            "--code" => {
                let code = args.next().context("missing signal code")?;
                options.signal_code = code.parse().context("failed to parse signal code")?;
            }
            "--errno" => {
                let errno = args.next().context("missing errno")?;
                options.signal_errno = errno.parse().context("failed to parse errno")?;
            }
            "--address" => {
                let address = args.next().context("missing fault address")?;
                options.signal_address = parse_address(&address).context("failed to parse fault address")?;
            }
            "--fastheaps" => options.fast_heap_dumps = true,
            "--singlefile" => options.app_model = AppModel::SingleFile,
            "--nativeaot" => options.app_model = AppModel::NativeAot,
            "-d" | "--diag" => options.diagnostics.verbose = true,
            "--logtofile" => {
                let path = args.next().context("missing log file path")?;
                options.diagnostics.log_file = Some(PathBuf::from(path));
            }
            "--wait" => wait = true,
            other if other.starts_with('-') => anyhow::bail!("invalid option {}", other),
            other => {
                if pid.is_some() {
                    anyhow::bail!("unexpected extra argument {}", other);
                }
                pid = Some(other.parse::<i32>().context("failed to parse pid")?);
            }
        }
    }

    options.pid = pid.context("missing pid")?;
    if options.pid <= 0 {
        anyhow::bail!("the pid must be positive");
    }

    Ok(Args {
        options,
        template: template.unwrap_or_else(|| DEFAULT_TEMPLATE.to_owned()),
        wait,
    })
}

fn parse_address(text: &str) -> Result<u64, std::num::ParseIntError> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    }
}

/// Values substituted into a dump file name template.
struct TemplateValues {
    pid: i32,
    executable: String,
    host_name: String,
    time: u64,
}

impl TemplateValues {
    fn of_process(pid: i32) -> Self {
        let executable = std::fs::read_to_string(format!("/proc/{}/comm", pid))
            .map(|comm| comm.trim_end().to_owned())
            .unwrap_or_default();
        let host_name = nix::unistd::gethostname()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        Self {
            pid,
            executable,
            host_name,
            time,
        }
    }
}

fn expand_template(template: &str, values: &TemplateValues) -> anyhow::Result<String> {
    let mut expanded = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            expanded.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => expanded.push('%'),
            Some('p') | Some('d') => expanded.push_str(&values.pid.to_string()),
            Some('e') => expanded.push_str(&values.executable),
            Some('h') => expanded.push_str(&values.host_name),
            Some('t') => expanded.push_str(&values.time.to_string()),
            Some(other) => anyhow::bail!("invalid dump name format char '{}'", other),
            None => anyhow::bail!("dump name template ends with '%'"),
        }
    }
    Ok(expanded)
}

fn init_tracing(options: &CreateDumpOptions) -> anyhow::Result<()> {
    let level = if options.diagnostics.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let builder = tracing_subscriber::fmt().with_max_level(level);
    match &options.diagnostics.log_file {
        Some(path) => {
            let file = std::fs::File::create(path).context("unable to create log file")?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn run(args: Args) -> anyhow::Result<DumpOutcome> {
    let Args {
        mut options,
        template,
        wait,
    } = args;

    if wait {
        println!("[createdump] pid {} waiting, press enter to continue", std::process::id());
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("failed to read from stdin")?;
    }

    let values = TemplateValues::of_process(options.pid);
    options.dump_path = PathBuf::from(expand_template(&template, &values)?);

    let inspector = LinuxInspector::new(options.pid).context("unable to inspect the process")?;
    let outcome = createdump::create_dump(&options, Box::new(inspector), &NoDataAccess, &mut FramePointerUnwinder)?;

    tracing::debug!("wrote {} bytes", outcome.dump_size);
    Ok(outcome)
}

fn status_line(outcome: &DumpOutcome) -> String {
    let what = if outcome.dump_path.is_some() {
        "Dump"
    } else {
        "Crash report"
    };
    format!(
        "[createdump] {} successfully written in {}ms",
        what,
        outcome.elapsed.as_millis()
    )
}

pub fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{:#}", e);
            eprintln!("{}", USAGE);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_tracing(&args.options) {
        eprintln!("[createdump] FAILED: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(outcome) => {
            println!("{}", status_line(&outcome));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("[createdump] FAILED: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> TemplateValues {
        TemplateValues {
            pid: 42,
            executable: "dotnet".to_owned(),
            host_name: "box".to_owned(),
            time: 1700000000,
        }
    }

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn template_specifiers() {
        assert_eq!(
            expand_template("/tmp/%e.%p.%h.%t%%", &values()).unwrap(),
            "/tmp/dotnet.42.box.1700000000%"
        );
        assert_eq!(expand_template(DEFAULT_TEMPLATE, &values()).unwrap(), "/tmp/coredump.42");
        assert_eq!(expand_template("core.%d", &values()).unwrap(), "core.42");
        assert!(expand_template("core.%x", &values()).is_err());
        assert!(expand_template("core.%", &values()).is_err());
    }

    #[test]
    fn options_from_arguments() {
        let parsed = args(&["-u", "--crashreport", "--crashthread", "7", "--signal", "11", "-f", "/d/%p", "99"]).unwrap();
        assert_eq!(parsed.options.pid, 99);
        assert_eq!(parsed.options.dump_type, DumpType::Full);
        assert!(parsed.options.crash_report);
        assert_eq!(parsed.options.crash_thread, Some(7));
        assert_eq!(parsed.options.signal, 11);
        assert_eq!(parsed.template, "/d/%p");
        assert!(!parsed.wait);

        let parsed = args(&["--singlefile", "-d", "--wait", "5"]).unwrap();
        assert_eq!(parsed.options.app_model, AppModel::SingleFile);
        assert!(parsed.options.diagnostics.verbose);
        assert!(parsed.wait);
        assert_eq!(parsed.template, DEFAULT_TEMPLATE);
        assert_eq!(parsed.options.signal_code, 0);
        assert!(!parsed.options.fast_heap_dumps);
    }

    #[test]
    fn fault_details_from_arguments() {
        let parsed = args(&["--code", "1", "--errno", "14", "--address", "0xdeadbeef", "--fastheaps", "3"]).unwrap();
        assert_eq!(parsed.options.signal_code, 1);
        assert_eq!(parsed.options.signal_errno, 14);
        assert_eq!(parsed.options.signal_address, 0xdead_beef);
        assert!(parsed.options.fast_heap_dumps);

        let parsed = args(&["--address", "4096", "3"]).unwrap();
        assert_eq!(parsed.options.signal_address, 0x1000);

        assert!(args(&["--address", "0xzz", "3"]).is_err());
        assert!(args(&["--code", "3"]).is_err());
        assert!(args(&["--errno"]).is_err());
    }

    #[test]
    fn status_names_what_was_written() {
        let mut outcome = DumpOutcome {
            dump_path: Some(PathBuf::from("/tmp/coredump.42")),
            dump_size: 4096,
            crash_report_path: None,
            elapsed: std::time::Duration::from_millis(12),
        };
        assert_eq!(status_line(&outcome), "[createdump] Dump successfully written in 12ms");

        outcome.dump_path = None;
        outcome.crash_report_path = Some(PathBuf::from("/tmp/coredump.42.crashreport.json"));
        assert_eq!(
            status_line(&outcome),
            "[createdump] Crash report successfully written in 12ms"
        );
    }

    #[test]
    fn bad_arguments() {
        assert!(args(&[]).is_err());
        assert!(args(&["-x", "5"]).is_err());
        assert!(args(&["5", "6"]).is_err());
        assert!(args(&["0"]).is_err());
        assert!(args(&["--crashthread"]).is_err());
    }
}
