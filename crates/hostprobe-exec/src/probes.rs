//! Built-in telemetry probes and their conversion into scheduler tasks.

use std::sync::Arc;
use std::time::Duration;

use hostprobe_core::{ProbeSpec, ShellDialect};

use crate::invoker::RetryingInvoker;
use crate::outcome::Outcome;
use crate::runner::CommandRunner;
use crate::scheduler::{TaskContext, TaskDescriptor};

const POSIX_PROBES: &[(&str, &str)] = &[
    ("hostname", "hostname 2>/dev/null || uname -n"),
    ("os", "cat /etc/os-release 2>/dev/null || sw_vers 2>/dev/null || uname -s"),
    ("kernel", "uname -srvm"),
    ("uptime", "uptime"),
    (
        "cpu",
        "grep -m1 'model name' /proc/cpuinfo 2>/dev/null || sysctl -n machdep.cpu.brand_string; \
         nproc 2>/dev/null || sysctl -n hw.ncpu",
    ),
    ("memory", "free -b 2>/dev/null || vm_stat"),
    ("disks", "df -kP"),
    ("network", "ip -o addr show 2>/dev/null || ifconfig -a"),
    ("users", "who"),
    ("processes", "ps -eo pid,ppid,user,pcpu,pmem,comm"),
];

const POWERSHELL_PROBES: &[(&str, &str)] = &[
    ("hostname", "$env:COMPUTERNAME"),
    (
        "os",
        "Get-CimInstance Win32_OperatingSystem | \
         Select-Object Caption,Version,BuildNumber,OSArchitecture | ConvertTo-Json -Compress",
    ),
    ("kernel", "[System.Environment]::OSVersion.VersionString"),
    (
        "uptime",
        "((Get-Date) - (Get-CimInstance Win32_OperatingSystem).LastBootUpTime).TotalSeconds",
    ),
    (
        "cpu",
        "Get-CimInstance Win32_Processor | \
         Select-Object Name,NumberOfCores,NumberOfLogicalProcessors | ConvertTo-Json -Compress",
    ),
    (
        "memory",
        "Get-CimInstance Win32_OperatingSystem | \
         Select-Object TotalVisibleMemorySize,FreePhysicalMemory | ConvertTo-Json -Compress",
    ),
    (
        "disks",
        "Get-CimInstance Win32_LogicalDisk | \
         Select-Object DeviceID,FileSystem,Size,FreeSpace | ConvertTo-Json -Compress",
    ),
    (
        "network",
        "Get-NetIPAddress | Select-Object InterfaceAlias,IPAddress,AddressFamily | \
         ConvertTo-Json -Compress",
    ),
    ("users", "(Get-CimInstance Win32_ComputerSystem).UserName"),
    (
        "processes",
        "Get-Process | Select-Object Id,ProcessName,CPU,WorkingSet | ConvertTo-Json -Compress",
    ),
];

/// The built-in probe catalog for a shell dialect.
pub fn default_probes(dialect: ShellDialect) -> Vec<ProbeSpec> {
    let table = match dialect {
        ShellDialect::Posix => POSIX_PROBES,
        ShellDialect::PowerShell => POWERSHELL_PROBES,
    };
    table
        .iter()
        .map(|(name, command)| ProbeSpec::new(*name, *command))
        .collect()
}

/// Turn probes into scheduler tasks that run their command through `invoker`.
///
/// Probes with `timeout_ms` get a per-task timeout override. A task whose
/// context is cancelled stops waiting and reports an error.
pub fn build_tasks<R>(
    probes: &[ProbeSpec],
    runner: &Arc<R>,
    invoker: RetryingInvoker,
) -> Vec<TaskDescriptor<String>>
where
    R: CommandRunner + 'static,
{
    probes
        .iter()
        .map(|probe| {
            let runner = Arc::clone(runner);
            let command = probe.command.clone();
            let task = TaskDescriptor::new(probe.name.clone(), move |ctx: TaskContext| async move {
                let invocation = invoker.invoke(&ctx.name, || runner.run(&command));
                tokio::select! {
                    outcome = invocation => outcome,
                    () = ctx.cancel.cancelled() => Outcome::Error("cancelled".to_string()),
                }
            })
            .with_result_key(probe.key());
            match probe.timeout_ms {
                Some(ms) => task.with_timeout(Duration::from_millis(ms)),
                None => task,
            }
        })
        .collect()
}
