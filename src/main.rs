use chrono::{DateTime, NaiveDate};
use clap::{Parser, Subcommand};
use dirs::home_dir;
use filetime::{set_file_mtime, FileTime};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::json;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

const NO_PROMPT_LEGACY: &str = "-noprompt";
const NO_PROMPT_CURRENT: &str = "--no-prompt";

const DEFAULT_SOLR_PORT: u16 = 8983;
const DOWNLOAD_TIMEOUT_SECS: u64 = 600;
const PROBE_TIMEOUT_SECS: u64 = 10;

#[derive(Parser, Debug)]
#[command(name = "solrup", version, about = "Solrup CLI")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Provision,
    Up {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        verbose: bool,
    },
    Down,
    Status,
    CreateCore {
        name: String,
        #[arg(long = "config-set")]
        config_set: String,
    },
    Run {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        verbose: bool,
    },
    Doctor,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Edit,
    Validate,
}

#[derive(Debug, Error)]
enum SolrupError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("all mirrors failed: {0}")]
    Download(String),
    #[error("solr status endpoint missing (HTTP 404) at {0}")]
    EndpointMissing(String),
    #[error("solr not ready after {tries} tries ({waited_ms} ms)")]
    NotReady { tries: u32, waited_ms: u64 },
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Config {
    version: u32,
    solr: Solr,
    mirror: Mirror,
    cache: Cache,
    ready: Ready,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Solr {
    version: String,
    port: u16,
    home: String,
    heap: String,
    vm_params: String,
    extra_args: String,
    cloud: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Mirror {
    primary: String,
    fallback: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Cache {
    root: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Ready {
    host: String,
    retries: u32,
    wait_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            solr: Solr::default(),
            mirror: Mirror::default(),
            cache: Cache::default(),
            ready: Ready::default(),
        }
    }
}

impl Default for Solr {
    fn default() -> Self {
        Self {
            version: "9.8.1".to_string(),
            port: DEFAULT_SOLR_PORT,
            home: "".to_string(),
            heap: "".to_string(),
            vm_params: "-XX:+IgnoreUnrecognizedVMOptions".to_string(),
            extra_args: "".to_string(),
            cloud: false,
        }
    }
}

impl Default for Mirror {
    fn default() -> Self {
        Self {
            primary: "https://dlcdn.apache.org".to_string(),
            fallback: "https://archive.apache.org/dist".to_string(),
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            root: "~/.cache/solrup".to_string(),
        }
    }
}

impl Default for Ready {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            retries: 10,
            wait_ms: 1000,
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

fn main() -> Result<(), SolrupError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli);

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Provision => handle_provision(&ctx),
        Commands::Up { force, verbose } => handle_up(&ctx, force, verbose),
        Commands::Down => handle_down(&ctx),
        Commands::Status => handle_status(&ctx),
        Commands::CreateCore { name, config_set } => handle_create_core(&ctx, name, config_set),
        Commands::Run { force, verbose } => handle_run(&ctx, force, verbose),
        Commands::Doctor => handle_doctor(&ctx),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    }
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("SOLRUP_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("SOLRUP_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("solrup");
    base
}

fn ensure_parent(path: &Path) -> Result<(), SolrupError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<Config, SolrupError> {
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    if cfg.version != 1 {
        return Err(SolrupError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    Ok(cfg)
}

fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), SolrupError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Edit => {
            if !ctx.config_path.exists() {
                ensure_parent(&ctx.config_path)?;
                fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            }
            let editor = env::var("VISUAL").ok().or_else(|| env::var("EDITOR").ok());
            if let Some(editor) = editor {
                let status = Command::new(editor)
                    .arg(&ctx.config_path)
                    .status()
                    .map_err(|err| {
                        SolrupError::Process(format!("failed to launch editor: {err}"))
                    })?;
                if !status.success() {
                    return Err(SolrupError::Process("editor exited with error".to_string()));
                }
                output(ctx, json!({"path": ctx.config_path}))
            } else {
                Err(SolrupError::Process(
                    "EDITOR is not set; please edit the config file manually".to_string(),
                ))
            }
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
    }
}

// ---------------------------------------------------------------------------
// Solr version handling

fn version_parts(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn major_version(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

struct FlagRule {
    applies: fn(u32, u32) -> bool,
    flag: &'static str,
}

// Ordered; first match wins. Solr 9.7 renamed -noprompt to --no-prompt with
// no backwards compatibility. Append a new rule here if the flag breaks again.
const NO_PROMPT_RULES: &[FlagRule] = &[
    FlagRule {
        applies: |major, minor| major < 9 || (major == 9 && minor <= 6),
        flag: NO_PROMPT_LEGACY,
    },
    FlagRule {
        applies: |_, _| true,
        flag: NO_PROMPT_CURRENT,
    },
];

/// Unparsable versions get the current spelling.
fn no_prompt_flag(version: &str) -> &'static str {
    let Some((major, minor)) = version_parts(version) else {
        return NO_PROMPT_CURRENT;
    };
    NO_PROMPT_RULES
        .iter()
        .find(|rule| (rule.applies)(major, minor))
        .map(|rule| rule.flag)
        .unwrap_or(NO_PROMPT_CURRENT)
}

// ---------------------------------------------------------------------------
// Archive provisioning

#[derive(Debug, Clone)]
struct ArchiveSource {
    primary: String,
    fallback: String,
    version: String,
    target_dir: PathBuf,
    archive_path: PathBuf,
}

#[derive(Debug)]
enum Provision {
    Missing,
    Ready(PathBuf),
}

fn archive_source(cfg: &Config) -> ArchiveSource {
    let cache_root = PathBuf::from(expand_path(&cfg.cache.root));
    let version = cfg.solr.version.trim().to_string();
    let target_dir = cache_root.join(format!("solr-{version}"));
    let archive_path = cache_root.join(format!("solr-{}.{}", version, archive_ext(&version)));
    ArchiveSource {
        primary: cfg.mirror.primary.clone(),
        fallback: cfg.mirror.fallback.clone(),
        version,
        target_dir,
        archive_path,
    }
}

// Solr moved from the lucene/ zip mirrors to the solr/ tgz layout with 9.0.
fn legacy_layout(version: &str) -> bool {
    major_version(version).map(|major| major < 9).unwrap_or(false)
}

fn archive_ext(version: &str) -> &'static str {
    if legacy_layout(version) {
        "zip"
    } else {
        "tgz"
    }
}

fn archive_url(base: &str, version: &str) -> String {
    let base = base.trim_end_matches('/');
    let prefix = if legacy_layout(version) {
        "lucene/solr"
    } else {
        "solr/solr"
    };
    format!(
        "{base}/{prefix}/{version}/solr-{}.{}",
        version,
        archive_ext(version)
    )
}

fn control_script_path(target_dir: &Path) -> PathBuf {
    let name = if cfg!(windows) { "solr.cmd" } else { "solr" };
    target_dir.join("bin").join(name)
}

fn provision_state(source: &ArchiveSource) -> Provision {
    let exe = control_script_path(&source.target_dir);
    if exe.exists() {
        Provision::Ready(exe)
    } else {
        Provision::Missing
    }
}

/// Idempotent: the presence of the control script means "already provisioned".
/// An interrupted extraction may leave a partial tree behind; removing the
/// target directory forces a clean re-extraction.
fn ensure_provisioned(ctx: &Context, source: &ArchiveSource) -> Result<PathBuf, SolrupError> {
    if let Provision::Ready(exe) = provision_state(source) {
        return Ok(exe);
    }
    if !source.archive_path.exists() {
        download_archive(ctx, source)?;
    }
    extract_archive(ctx, source)?;
    match provision_state(source) {
        Provision::Ready(exe) => Ok(exe),
        Provision::Missing => Err(SolrupError::Archive(format!(
            "archive did not contain {}",
            control_script_path(&source.target_dir).display()
        ))),
    }
}

fn download_archive(ctx: &Context, source: &ArchiveSource) -> Result<(), SolrupError> {
    let mut failures = Vec::new();
    for base in [&source.primary, &source.fallback] {
        let url = archive_url(base, &source.version);
        match fetch_archive(ctx, &url, &source.archive_path) {
            Ok(()) => return Ok(()),
            Err(err) => failures.push(format!("{url}: {err}")),
        }
    }
    Err(SolrupError::Download(failures.join("; ")))
}

fn fetch_archive(ctx: &Context, url: &str, dest: &Path) -> Result<(), SolrupError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .build()?;
    let mut response = client.get(url).send()?;
    if !response.status().is_success() {
        return Err(SolrupError::Archive(format!("HTTP {}", response.status())));
    }
    if !ctx.json {
        eprintln!("downloading {} to {}", url, dest.display());
    }
    let last_modified = response
        .headers()
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    ensure_parent(dest)?;
    let mut file = fs::File::create(dest)?;
    response.copy_to(&mut file)?;
    drop(file);
    if let Some(raw) = last_modified {
        match DateTime::parse_from_rfc2822(&raw) {
            Ok(when) => {
                let _ = set_file_mtime(dest, FileTime::from_unix_time(when.timestamp(), 0));
            }
            Err(err) => eprintln!("ignoring unparsable Last-Modified header {raw:?}: {err}"),
        }
    }
    Ok(())
}

fn extract_archive(ctx: &Context, source: &ArchiveSource) -> Result<(), SolrupError> {
    if !ctx.json {
        eprintln!(
            "extracting {} to {}",
            source.archive_path.display(),
            source.target_dir.display()
        );
    }
    fs::create_dir_all(&source.target_dir)?;
    let folder = format!("solr-{}", source.version);
    match source.archive_path.extension().and_then(|ext| ext.to_str()) {
        Some("zip") => extract_zip(&source.archive_path, &source.target_dir, &folder),
        _ => extract_tgz(&source.archive_path, &source.target_dir, &folder),
    }
}

fn extract_tgz(archive: &Path, target: &Path, folder: &str) -> Result<(), SolrupError> {
    let file = fs::File::open(archive)
        .map_err(|err| SolrupError::Archive(format!("cannot open {}: {err}", archive.display())))?;
    let mut tarball = tar::Archive::new(GzDecoder::new(file));
    for entry in tarball.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.to_string_lossy().into_owned();
        let Some(name) = entry_target_name(&raw, folder)? else {
            continue;
        };
        let dest = target.join(&name);
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            fs::create_dir_all(&dest)?;
            continue;
        }
        if !kind.is_file() {
            continue;
        }
        ensure_parent(&dest)?;
        let mut out = fs::File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;
        drop(out);
        if let Ok(mode) = entry.header().mode() {
            restore_mode(&dest, mode);
        }
        if let Ok(mtime) = entry.header().mtime() {
            let _ = set_file_mtime(&dest, FileTime::from_unix_time(mtime as i64, 0));
        }
    }
    Ok(())
}

fn extract_zip(archive: &Path, target: &Path, folder: &str) -> Result<(), SolrupError> {
    let file = fs::File::open(archive)
        .map_err(|err| SolrupError::Archive(format!("cannot open {}: {err}", archive.display())))?;
    let mut zipped = zip::ZipArchive::new(file)?;
    for index in 0..zipped.len() {
        let mut entry = zipped.by_index(index)?;
        let raw = entry.name().to_string();
        let Some(name) = entry_target_name(&raw, folder)? else {
            continue;
        };
        let dest = target.join(&name);
        if entry.is_dir() {
            fs::create_dir_all(&dest)?;
            continue;
        }
        ensure_parent(&dest)?;
        let mut out = fs::File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;
        drop(out);
        if let Some(mode) = entry.unix_mode() {
            restore_mode(&dest, mode);
        }
        if let Some(mtime) = zip_entry_mtime(entry.last_modified()) {
            let _ = set_file_mtime(&dest, mtime);
        }
    }
    Ok(())
}

/// Strips the archive's own top-level folder so the target root directly
/// contains bin/, server/ and friends. Returns None for the root folder entry.
fn entry_target_name(raw: &str, folder: &str) -> Result<Option<String>, SolrupError> {
    let name = stripped_entry_name(raw, folder);
    if name.is_empty() {
        return Ok(None);
    }
    if name.split('/').any(|part| part == "..") {
        return Err(SolrupError::Archive(format!("unsafe path in archive: {raw}")));
    }
    Ok(Some(name))
}

fn stripped_entry_name(raw: &str, folder: &str) -> String {
    let name = raw.strip_prefix(folder).unwrap_or(raw);
    name.trim_start_matches('/').to_string()
}

/// Nine-bit owner/group/other rwx mapping; upper bits (setuid, sticky) are dropped.
fn permission_bits(mode: u32) -> u32 {
    mode & 0o777
}

#[cfg(unix)]
fn restore_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(permission_bits(mode)));
}

#[cfg(not(unix))]
fn restore_mode(_path: &Path, _mode: u32) {}

fn zip_entry_mtime(stamp: zip::DateTime) -> Option<FileTime> {
    let date = NaiveDate::from_ymd_opt(
        i32::from(stamp.year()),
        u32::from(stamp.month()),
        u32::from(stamp.day()),
    )?;
    let when = date.and_hms_opt(
        u32::from(stamp.hour()),
        u32::from(stamp.minute()),
        u32::from(stamp.second()),
    )?;
    Some(FileTime::from_unix_time(when.and_utc().timestamp(), 0))
}

// ---------------------------------------------------------------------------
// Control script invocation

#[derive(Debug, Clone)]
struct SolrRunner {
    executable: PathBuf,
    foreground: bool,
    port: Option<u16>,
    solr_home: Option<String>,
    heap: Option<String>,
    vm_params: Option<String>,
    extra_args: Option<String>,
    cloud_mode: bool,
    no_prompt: bool,
    force: bool,
    verbose: bool,
    version: String,
}

impl SolrRunner {
    fn raw_args(&self, operation: &[&str]) -> Vec<String> {
        let mut args = vec![self.executable.to_string_lossy().into_owned()];
        args.extend(operation.iter().map(|token| token.to_string()));
        args
    }

    fn build_args(&self, operation: &[&str]) -> Vec<String> {
        let mut args = self.raw_args(operation);
        if self.foreground {
            args.push("-f".to_string());
        }
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(home) = &self.solr_home {
            args.push("-s".to_string());
            args.push(home.clone());
        }
        if let Some(heap) = &self.heap {
            args.push("-m".to_string());
            args.push(heap.clone());
        }
        if let Some(vm_params) = &self.vm_params {
            args.push("-a".to_string());
            args.push(vm_params.clone());
        }
        if self.cloud_mode && !operation.contains(&"-c") {
            args.push("-c".to_string());
        }
        if self.no_prompt {
            args.push(no_prompt_flag(&self.version).to_string());
        }
        if self.force {
            args.push("-force".to_string());
        }
        if self.verbose {
            args.push("-v".to_string());
        }
        if let Some(extra) = &self.extra_args {
            args.extend(extra.split_whitespace().map(str::to_string));
        }
        args
    }

    // solr create rejects the no-prompt flag in any spelling, so it is
    // stripped after construction rather than suppressed during it.
    fn create_core_args(&self, core: &str, config_set: &str) -> Vec<String> {
        let mut args = self.build_args(&["create", "-d", config_set, "-c", core]);
        args.retain(|arg| arg != NO_PROMPT_LEGACY && arg != NO_PROMPT_CURRENT);
        args
    }

    fn start(&self) -> Result<i32, SolrupError> {
        self.run(&self.build_args(&["start"]))
    }

    fn stop(&self) -> Result<i32, SolrupError> {
        self.run(&self.build_args(&["stop"]))
    }

    fn create_core(&self, core: &str, config_set: &str) -> Result<i32, SolrupError> {
        self.run(&self.create_core_args(core, config_set))
    }

    /// No-op success when <home>/security.json does not exist. The zk port
    /// offset of +1000 is an undocumented solr convention.
    fn upload_security_json(&self) -> Result<i32, SolrupError> {
        let Some(home) = &self.solr_home else {
            return Ok(0);
        };
        let security_json = Path::new(home).join("security.json");
        if !security_json.exists() {
            return Ok(0);
        }
        let zk_host = format!(
            "localhost:{}",
            u32::from(self.port.unwrap_or(DEFAULT_SOLR_PORT)) + 1000
        );
        let security_path = security_json.to_string_lossy().into_owned();
        let args = self.raw_args(&[
            "zk",
            "cp",
            security_path.as_str(),
            "zk:security.json",
            "-z",
            zk_host.as_str(),
        ]);
        self.run(&args)
    }

    fn run(&self, args: &[String]) -> Result<i32, SolrupError> {
        let child = self.spawn(args)?;
        self.wait(child)
    }

    fn spawn(&self, args: &[String]) -> Result<Child, SolrupError> {
        Command::new(&args[0])
            .args(&args[1..])
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| SolrupError::Process(format!("failed to run {}: {err}", args[0])))
    }

    fn wait(&self, mut child: Child) -> Result<i32, SolrupError> {
        let status = child
            .wait()
            .map_err(|err| SolrupError::Process(format!("failed to wait for solr: {err}")))?;
        Ok(status.code().unwrap_or(-1))
    }
}

// ---------------------------------------------------------------------------
// Readiness polling

trait ReadyObserver {
    fn info(&self, _message: &str) {}
    fn debug(&self, _message: &str) {}
}

struct SilentObserver;

impl ReadyObserver for SilentObserver {}

struct ConsoleObserver {
    verbose: bool,
}

impl ReadyObserver for ConsoleObserver {
    fn info(&self, message: &str) {
        eprintln!("{message}");
    }

    fn debug(&self, message: &str) {
        if self.verbose {
            eprintln!("{message}");
        }
    }
}

#[derive(Debug)]
enum Probe {
    Ready,
    AuthRequired,
    EndpointMissing,
    NotReady(String),
}

struct ReadyChecker {
    host: String,
    port: u16,
    retries: u32,
    wait: Duration,
    observer: Box<dyn ReadyObserver>,
}

impl ReadyChecker {
    fn new(
        host: impl Into<String>,
        port: u16,
        retries: u32,
        wait: Duration,
        observer: Box<dyn ReadyObserver>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            retries,
            wait,
            observer,
        }
    }

    fn cores_url(&self) -> String {
        format!(
            "http://{}:{}/solr/admin/cores?indexInfo=false&wt=json",
            self.host, self.port
        )
    }

    fn wait_for_ready(&self) -> Result<(), SolrupError> {
        self.observer.info("waiting for all cores to be ready...");
        for _ in 0..self.retries {
            match self.probe() {
                Probe::Ready => {
                    self.observer.info("all cores are ready.");
                    return Ok(());
                }
                Probe::AuthRequired => {
                    self.observer
                        .info("authentication is enabled; core status cannot be inspected");
                    if !self.wait.is_zero() {
                        thread::sleep(self.wait);
                    }
                    return Ok(());
                }
                Probe::EndpointMissing => {
                    return Err(SolrupError::EndpointMissing(self.cores_url()));
                }
                Probe::NotReady(reason) => {
                    self.observer.debug(&reason);
                    self.observer.info("solr not ready yet, waiting...");
                }
            }
            if !self.wait.is_zero() {
                thread::sleep(self.wait);
            }
        }
        Err(SolrupError::NotReady {
            tries: self.retries,
            waited_ms: u64::from(self.retries) * self.wait.as_millis() as u64,
        })
    }

    fn probe(&self) -> Probe {
        let client = match reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .build()
        {
            Ok(client) => client,
            Err(err) => return Probe::NotReady(format!("http client error: {err}")),
        };
        let response = match client.get(self.cores_url()).send() {
            Ok(response) => response,
            Err(err) => return Probe::NotReady(format!("connection failed: {err}")),
        };
        match response.status() {
            reqwest::StatusCode::UNAUTHORIZED => return Probe::AuthRequired,
            reqwest::StatusCode::NOT_FOUND => return Probe::EndpointMissing,
            status if !status.is_success() => {
                return Probe::NotReady(format!("HTTP {status}"));
            }
            _ => {}
        }
        let body = match response.text() {
            Ok(body) => body,
            Err(err) => return Probe::NotReady(format!("unreadable body: {err}")),
        };
        // Malformed bodies are expected while solr is still starting up.
        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(root) if all_cores_ready(&root) => Probe::Ready,
            Ok(_) => Probe::NotReady("cores are still coming up".to_string()),
            Err(err) => Probe::NotReady(format!("malformed status body: {err}")),
        }
    }

    fn is_alive(&self) -> bool {
        let Ok(client) = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .build()
        else {
            return false;
        };
        client.get(self.cores_url()).send().is_ok()
    }
}

/// All-or-nothing gate: every core must report a positive uptime. No cores
/// registered at all counts as ready.
fn all_cores_ready(root: &serde_json::Value) -> bool {
    let Some(status) = root.get("status").and_then(|status| status.as_object()) else {
        return false;
    };
    status.values().all(|core| core_uptime(core) > 0)
}

fn core_uptime(core: &serde_json::Value) -> i64 {
    core.as_object()
        .and_then(|core| core.get("uptime"))
        .and_then(|uptime| uptime.as_i64())
        .unwrap_or(-1)
}

// ---------------------------------------------------------------------------
// Lifecycle orchestration

fn build_runner(cfg: &Config, executable: PathBuf, force: bool, verbose: bool) -> SolrRunner {
    SolrRunner {
        executable,
        foreground: false,
        port: Some(cfg.solr.port),
        solr_home: optional(&cfg.solr.home).map(|home| expand_path(&home)),
        heap: optional(&cfg.solr.heap),
        vm_params: optional(&cfg.solr.vm_params),
        extra_args: optional(&cfg.solr.extra_args),
        cloud_mode: cfg.solr.cloud,
        no_prompt: true,
        force,
        verbose,
        version: cfg.solr.version.trim().to_string(),
    }
}

fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn ready_checker(cfg: &Config, observer: Box<dyn ReadyObserver>) -> ReadyChecker {
    ReadyChecker::new(
        cfg.ready.host.clone(),
        cfg.solr.port,
        cfg.ready.retries,
        Duration::from_millis(cfg.ready.wait_ms),
        observer,
    )
}

fn start_solr(
    ctx: &Context,
    cfg: &Config,
    force: bool,
    verbose: bool,
) -> Result<SolrRunner, SolrupError> {
    let source = archive_source(cfg);
    let executable = ensure_provisioned(ctx, &source)?;
    let runner = build_runner(cfg, executable, force, verbose);

    let code = runner.start()?;
    if code != 0 {
        return Err(SolrupError::Process(format!("solr start returned {code}")));
    }

    let checker = ready_checker(cfg, Box::new(ConsoleObserver { verbose }));
    checker.wait_for_ready()?;

    if cfg.solr.cloud {
        let code = runner.upload_security_json()?;
        if code != 0 {
            return Err(SolrupError::Process(format!(
                "security.json upload returned {code}"
            )));
        }
    }

    Ok(runner)
}

/// Stops solr when dropped if it still answers its status endpoint. Failures
/// are logged only; this runs during teardown with no caller left to notify.
struct StopGuard {
    runner: SolrRunner,
    checker: ReadyChecker,
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if !self.checker.is_alive() {
            return;
        }
        eprintln!("stopping solr on exit...");
        match self.runner.stop() {
            Ok(0) => {}
            Ok(code) => eprintln!("solr stop returned {code}"),
            Err(err) => eprintln!("failed to stop solr: {err}"),
        }
    }
}

fn handle_provision(ctx: &Context) -> Result<(), SolrupError> {
    let cfg = read_config(&ctx.config_path)?;
    let source = archive_source(&cfg);
    let already = matches!(provision_state(&source), Provision::Ready(_));
    let executable = ensure_provisioned(ctx, &source)?;
    output(
        ctx,
        json!({"executable": executable, "already_provisioned": already}),
    )
}

fn handle_up(ctx: &Context, force: bool, verbose: bool) -> Result<(), SolrupError> {
    let cfg = read_config(&ctx.config_path)?;
    start_solr(ctx, &cfg, force, verbose)?;
    output(
        ctx,
        json!({"action": "up", "port": cfg.solr.port, "cloud": cfg.solr.cloud}),
    )
}

fn handle_down(ctx: &Context) -> Result<(), SolrupError> {
    let cfg = read_config(&ctx.config_path)?;
    let source = archive_source(&cfg);
    let executable = ensure_provisioned(ctx, &source)?;
    let runner = build_runner(&cfg, executable, false, false);
    let code = runner.stop()?;
    if code != 0 {
        return Err(SolrupError::Process(format!("solr stop returned {code}")));
    }
    output(ctx, json!({"action": "down"}))
}

fn handle_status(ctx: &Context) -> Result<(), SolrupError> {
    let cfg = read_config(&ctx.config_path)?;
    let checker = ReadyChecker::new(
        cfg.ready.host.clone(),
        cfg.solr.port,
        1,
        Duration::ZERO,
        Box::new(SilentObserver),
    );
    match checker.probe() {
        Probe::Ready => output(ctx, json!({"ready": true})),
        Probe::AuthRequired => output(
            ctx,
            json!({"ready": true, "note": "authentication enabled; core status not inspected"}),
        ),
        Probe::EndpointMissing => Err(SolrupError::EndpointMissing(checker.cores_url())),
        Probe::NotReady(reason) => output(ctx, json!({"ready": false, "reason": reason})),
    }
}

fn handle_create_core(ctx: &Context, name: String, config_set: String) -> Result<(), SolrupError> {
    let cfg = read_config(&ctx.config_path)?;
    let source = archive_source(&cfg);
    let executable = ensure_provisioned(ctx, &source)?;
    let runner = build_runner(&cfg, executable, false, false);
    let code = runner.create_core(&name, &config_set)?;
    if code != 0 {
        return Err(SolrupError::Process(format!("solr create returned {code}")));
    }
    output(ctx, json!({"core": name, "config_set": config_set}))
}

fn handle_run(ctx: &Context, force: bool, verbose: bool) -> Result<(), SolrupError> {
    let cfg = read_config(&ctx.config_path)?;
    let runner = start_solr(ctx, &cfg, force, verbose)?;

    let guard_checker = ReadyChecker::new(
        cfg.ready.host.clone(),
        cfg.solr.port,
        1,
        Duration::ZERO,
        Box::new(SilentObserver),
    );
    let _guard = StopGuard {
        runner,
        checker: guard_checker,
    };

    let term = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, Arc::clone(&term))?;
    flag::register(SIGTERM, Arc::clone(&term))?;

    if !ctx.json {
        eprintln!("solr is running; press Ctrl-C to stop");
    }
    while !term.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }

    output(ctx, json!({"action": "run"}))
}

fn handle_doctor(ctx: &Context) -> Result<(), SolrupError> {
    let mut checks = BTreeMap::new();
    let java_ok = which::which("java").is_ok();
    checks.insert("java".to_string(), java_ok);

    let cfg = read_config(&ctx.config_path)?;
    let cache_root = PathBuf::from(expand_path(&cfg.cache.root));
    let cache_ok = fs::create_dir_all(&cache_root)
        .and_then(|_| {
            let test_path = cache_root.join(".solrup_write_test");
            fs::write(&test_path, b"ok")?;
            fs::remove_file(&test_path)?;
            Ok(())
        })
        .is_ok();
    checks.insert("cache_root_writable".to_string(), cache_ok);

    let ok = java_ok && cache_ok;
    let error = if ok {
        None
    } else if !java_ok {
        Some("java is not available".to_string())
    } else {
        Some("cache root is not writable".to_string())
    };

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks })),
            error,
        };
        print_json(&payload)?;
        return Ok(());
    }

    println!("Java: {}", if java_ok { "ok" } else { "missing" });
    println!(
        "Cache root: {}",
        if cache_ok { "writable" } else { "not writable" }
    );
    if !java_ok {
        return Err(SolrupError::Process("java is not available".to_string()));
    }
    if !cache_ok {
        return Err(SolrupError::Process(
            "cache root is not writable".to_string(),
        ));
    }
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), SolrupError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), SolrupError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
