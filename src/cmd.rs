use crate::db::{FirmwareDb, FlatFileDb};
use crate::diag::{Diagnostics, Severity};
use crate::engine::{self, Analysis};
use crate::error::DecodeError;
use crate::extract::{ExtractSummary, Verdict};
use crate::fpt::display_u32;
use crate::guid::GuidScanner;
use crate::huffman::HuffmanDict;
use crate::resolve;
use crate::scan::Scanner;
use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{ArgAction, Parser, ValueHint};
use console::Style;
use crossbeam_channel::unbounded;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressFinish, ProgressStyle};
use memmap2::Mmap;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::borrow::Cow;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{Read, Write as _};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::env;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use zip::ZipArchive;
use zip::result::ZipError;

/// Environment variable overriding the log filter.
const LOG_ENV: &str = "MERIPPER_LOG";

/// Database looked up next to the executable when `--db` is not given.
const DEFAULT_DB: &str = "MEA.dat";

/// Archive members treated as firmware images.
const IMAGE_EXTENSIONS: [&str; 3] = [".bin", ".rom", ".cap"];

const PROGRESS_UPDATE_FREQUENCY: u8 = 4;

#[derive(Debug, Parser)]
#[clap(
    about,
    author,
    disable_help_subcommand = true,
    help_template = FRIENDLY_HELP,
    propagate_version = true,
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cmd {
    /// Firmware images, or folders holding them
    #[clap(value_hint = ValueHint::AnyPath, value_name = "PATH", required = true)]
    paths: Vec<PathBuf>,

    /// Extract partitions and modules
    #[clap(long, short = 'x')]
    extract: bool,

    /// Set output directory
    #[clap(long, short, value_hint = ValueHint::DirPath, value_name = "PATH")]
    output_dir: Option<PathBuf>,

    /// Number of images processed in parallel
    #[clap(long, short, value_name = "NUMBER")]
    threads: Option<usize>,

    /// Print the $FPT and BPDT partition tables
    #[clap(long)]
    dfpt: bool,

    /// Print decoded extensions of extracted manifests, metadata and keys
    #[clap(long, requires = "extract")]
    ext: bool,

    /// Huffman dictionary used to decode Huffman compressed modules
    #[clap(long, value_hint = ValueHint::FilePath, value_name = "PATH")]
    huffman_dict: Option<PathBuf>,

    /// Firmware database (defaults to MEA.dat next to the executable)
    #[clap(long, value_hint = ValueHint::FilePath, value_name = "PATH")]
    db: Option<PathBuf>,

    /// External UEFI pattern scanner used to find the engine GUID
    #[clap(long, value_hint = ValueHint::ExecutablePath, value_name = "PATH")]
    guid_scanner: Option<PathBuf>,

    /// Pattern file for the GUID scanner instead of the built-in list
    #[clap(long, requires = "guid_scanner", value_hint = ValueHint::FilePath, value_name = "PATH")]
    guid_pattern: Option<PathBuf>,

    /// Folder receiving copies of images that raised messages (batch mode)
    #[clap(long, value_hint = ValueHint::DirPath, value_name = "PATH")]
    review_dir: Option<PathBuf>,

    /// Only print errors, warnings and notes
    #[clap(long, short)]
    quiet: bool,

    /// Increase log output (-v info, -vv debug)
    #[clap(long, short, action = ArgAction::Count)]
    verbose: u8,
}

pub enum ImageSource {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

// Lets every decoder take the image as a plain `&[u8]`.
impl Deref for ImageSource {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            ImageSource::Mapped(mmap) => mmap,
            ImageSource::Owned(vec) => vec,
        }
    }
}

/// Read-only state shared by every worker.
struct RunContext {
    scanner: Scanner,
    db: Option<Box<dyn FirmwareDb>>,
    dict: Option<HuffmanDict>,
    guid: Option<GuidScanner>,
    output: Option<PathBuf>,
}

/// Output of one image, rendered off the main thread.
struct ImageReport {
    text: String,
    flagged: bool,
}

/// Per-image output directories still being written, removed on Ctrl+C.
type CleanupState = Arc<Mutex<(Vec<PathBuf>, Option<PathBuf>, bool)>>;

impl Cmd {
    pub fn run(&self) -> Result<()> {
        if let Some(t) = self.threads {
            match t {
                0 => { /* Use default - valid */ }
                1..=256 => { /* Valid range */ }
                _ => {
                    bail!(
                        "Thread count must be between 1 and 256, got {}. \
                        Use 0 or omit -t to use all available CPU cores (recommended).",
                        t
                    );
                }
            }
        }
        self.init_logging();

        let images = self.collect_images()?;
        if images.is_empty() {
            bail!("No input files found in the given paths.");
        }
        let batch = images.len() > 1;

        let (output, created_new_dir) = if self.extract {
            let (dir, created) = self.create_output_dir()?;
            (Some(dir.into_owned()), created)
        } else {
            (None, false)
        };

        let ctx = RunContext {
            scanner: Scanner::new().context("unable to build signature scanner")?,
            db: self.open_db()?,
            dict: match &self.huffman_dict {
                Some(path) => Some(
                    HuffmanDict::load(path)
                        .with_context(|| format!("unable to load Huffman dictionary: {path:?}"))?,
                ),
                None => None,
            },
            guid: self
                .guid_scanner
                .clone()
                .map(|program| GuidScanner::new(program, self.guid_pattern.clone())),
            output: output.clone(),
        };

        let cleanup_state: CleanupState = Arc::new(Mutex::new((Vec::new(), output.clone(), created_new_dir)));
        let cancellation_token = Arc::new(AtomicBool::new(false));

        let cleanup_state_ctrlc = Arc::clone(&cleanup_state);
        let cancellation_token_ctrlc = Arc::clone(&cancellation_token);
        ctrlc::set_handler(move || {
            eprintln!("\n\n Received interrupt signal (Ctrl+C). Cleaning up and exiting...");

            // Signal all workers to stop taking images
            cancellation_token_ctrlc.store(true, Ordering::Release);
            std::thread::sleep(std::time::Duration::from_millis(100));
            if let Ok(state) = cleanup_state_ctrlc.lock() {
                let (dirs, base, base_is_new) = &*state;
                for dir in dirs {
                    if dir.exists() {
                        if let Err(e) = fs::remove_dir_all(dir) {
                            eprintln!("Failed to remove {}: {}", dir.display(), e);
                        } else {
                            eprintln!("Removed partial output: {}", dir.display());
                        }
                    }
                }
                if let (Some(base), true) = (base, *base_is_new) {
                    let _ = fs::remove_dir(base);
                }
            }
            std::process::exit(130); // Standard exit code for Ctrl+C (128 + SIGINT)
        })
        .context("Failed to set up Ctrl+C handler")?;

        if !batch {
            let report = self.process(&ctx, &images[0], &cleanup_state)?;
            print!("{}", report.text);
            return self.finish(output.as_deref());
        }

        let threadpool = self.get_threadpool()?;
        if let Some(t) = self.threads {
            if t > 0 {
                eprintln!("Using {} worker thread(s)", threadpool.current_num_threads());
            }
        }
        let progress_bar = self.create_progress_bar(images.len())?;
        let (sender, receiver) = unbounded::<(usize, Result<ImageReport>)>();

        threadpool.scope(|scope| {
            for (index, path) in images.iter().enumerate() {
                let sender = sender.clone();
                let progress_bar = progress_bar.clone();
                let cancellation_token = Arc::clone(&cancellation_token);
                let (ctx, cleanup_state) = (&ctx, &cleanup_state);
                scope.spawn(move |_| {
                    if cancellation_token.load(Ordering::Acquire) {
                        return;
                    }
                    let result = self.process(ctx, path, cleanup_state);
                    let _ = sender.send((index, result));
                    progress_bar.inc(1);
                });
            }
        });
        drop(sender);
        progress_bar.finish_and_clear();

        let mut results: Vec<_> = receiver.iter().collect();
        results.sort_by_key(|(index, _)| *index);

        let flagged = self.report_batch(output.as_deref(), &images, results, &mut std::io::stdout().lock())?;
        if flagged > 0 {
            eprintln!("{flagged} image(s) raised messages and were copied for review.");
        }
        self.finish(output.as_deref())
    }

    /// `MERIPPER_LOG` wins over `-v`.
    fn init_logging(&self) {
        let level = match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        };
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init();
    }

    /// Files given directly, plus the regular files one level inside any
    /// given folder.
    fn collect_images(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for path in &self.paths {
            let metadata =
                fs::metadata(path).with_context(|| format!("unable to access input: {path:?}"))?;
            if metadata.is_dir() {
                let mut files = fs::read_dir(path)
                    .with_context(|| format!("failed to read directory: {}", path.display()))?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|p| p.is_file())
                    .collect::<Vec<_>>();
                files.sort();
                out.extend(files);
            } else {
                out.push(path.clone());
            }
        }
        Ok(out)
    }

    fn open_db(&self) -> Result<Option<Box<dyn FirmwareDb>>> {
        if let Some(path) = &self.db {
            let db = FlatFileDb::open(path).with_context(|| format!("unable to read database: {path:?}"))?;
            return Ok(Some(Box::new(db)));
        }
        let default = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_DB)));
        match default.map(|path| FlatFileDb::open(&path)) {
            Some(Ok(db)) => {
                info!(entries = db.len(), "loaded default database");
                Ok(Some(Box::new(db)))
            }
            _ => {
                debug!("no default database, family detection uses heuristics only");
                Ok(None)
            }
        }
    }

    /// Analyze one image and, when asked, extract it.
    fn process(&self, ctx: &RunContext, path: &Path, cleanup_state: &CleanupState) -> Result<ImageReport> {
        let image = self.open_image_file(path)?;
        let mut analysis = match engine::analyze(&image, &ctx.scanner, ctx.db.as_deref()) {
            Ok(analysis) => analysis,
            Err(DecodeError::NoFirmwareSignature) => bail!("File does not contain Intel Engine firmware"),
            Err(e) => return Err(e).with_context(|| format!("failed to analyze {}", path.display())),
        };

        if let Some(scanner) = &ctx.guid {
            match self.scan_guid(scanner, path, &image) {
                Ok(Some(guid)) => analysis.diagnostics.note(format!("Detected Engine GUID {guid}!")),
                Ok(None) => {}
                Err(e) => {
                    warn!("GUID scanner failed: {e:#}");
                    analysis.diagnostics.error("Engine GUID detection failed!");
                }
            }
        }

        if ctx.dict.is_none() {
            analysis.note_missing_dictionary();
        }

        let summary = match &ctx.output {
            Some(base) => Some(self.extract_image(ctx, base, path, &image, &analysis, cleanup_state)?),
            None => None,
        };
        if let Some(summary) = &summary {
            analysis.diagnostics.extend(summary.diagnostics.clone());
        }

        let text = self
            .render(path, &image, &analysis, summary.as_ref())
            .context("failed to render report")?;
        Ok(ImageReport {
            text,
            flagged: !analysis.diagnostics.is_empty(),
        })
    }

    /// Zip archives are searched for the first firmware member, which is
    /// read into memory; anything else is mapped.
    fn open_image_file(&self, path: &Path) -> Result<ImageSource> {
        let file = File::open(path)
            .with_context(|| format!("unable to open file for reading: {path:?}"))?;

        match ZipArchive::new(&file) {
            Ok(mut archive) => {
                let name = archive
                    .file_names()
                    .find(|name| {
                        let lower = name.to_ascii_lowercase();
                        IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
                    })
                    .map(str::to_string)
                    .context("could not find a firmware image in archive")?;
                let mut member = archive
                    .by_name(&name)
                    .with_context(|| format!("could not open {name} in archive"))?;

                let mut buffer = Vec::with_capacity(member.size() as usize);
                member
                    .read_to_end(&mut buffer)
                    .with_context(|| format!("failed to decompress {name} from archive"))?;
                Ok(ImageSource::Owned(buffer))
            }
            Err(ZipError::InvalidArchive(_)) => {
                // Not a zip file, so memory-map it directly.
                let mmap = unsafe { Mmap::map(&file) }
                    .with_context(|| format!("failed to mmap file: {path:?}"))?;
                Ok(ImageSource::Mapped(mmap))
            }
            Err(e) => Err(e).context("failed to open zip archive"),
        }
    }

    /// The scanner needs a file on disk; images read out of an archive get
    /// a temporary copy that is removed on return.
    fn scan_guid(&self, scanner: &GuidScanner, path: &Path, image: &ImageSource) -> Result<Option<String>> {
        match image {
            ImageSource::Mapped(_) => Ok(scanner.scan(path)?),
            ImageSource::Owned(data) => {
                let mut copy = NamedTempFile::new().context("unable to create temporary image")?;
                copy.write_all(data).context("unable to write temporary image")?;
                copy.flush()?;
                Ok(scanner.scan(copy.path())?)
            }
        }
    }

    fn extract_image(
        &self,
        ctx: &RunContext,
        base: &Path,
        path: &Path,
        image: &[u8],
        analysis: &Analysis,
        cleanup_state: &CleanupState,
    ) -> Result<ExtractSummary> {
        let dir = self.image_dir(base, path)?;
        if let Ok(mut state) = cleanup_state.lock() {
            state.0.push(dir.clone());
        }
        let summary = engine::extract_image(image, analysis, &dir, ctx.dict.as_ref())
            .with_context(|| format!("failed to extract into {}", dir.display()))?;
        if let Ok(mut state) = cleanup_state.lock() {
            state.0.retain(|d| d != &dir);
        }
        Ok(summary)
    }

    /// Fresh folder named after the image.
    fn image_dir(&self, base: &Path, path: &Path) -> Result<PathBuf> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let mut dir = base.join(&name);
        let mut n = 1;
        while dir.exists() {
            n += 1;
            dir = base.join(format!("{name} ({n})"));
        }
        fs::create_dir_all(&dir).with_context(|| format!("could not create output directory: {dir:?}"))?;
        Ok(dir)
    }

    fn render(&self, path: &Path, image: &[u8], analysis: &Analysis, summary: Option<&ExtractSummary>) -> Result<String> {
        let mut out = String::new();
        let bold = Style::new().bold();
        let file_name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        writeln!(out, "{}", bold.apply_to(format!("File:     {file_name}")))?;

        if !self.quiet {
            writeln!(out, "Family:   {}", analysis.variant)?;
            writeln!(out, "Version:  {}", analysis.version_string())?;
            writeln!(out, "Release:  {}", analysis.release)?;
            writeln!(out, "Type:     {}", analysis.firmware_type)?;
            if let Some([major, minor, hotfix, build]) = analysis.fit_version {
                writeln!(out, "FIT Ver:  {major}.{minor}.{hotfix}.{build}")?;
            }
            writeln!(out, "Date:     {}", analysis.date)?;
            writeln!(out, "SVN:      {}", analysis.svn)?;
            writeln!(out, "VCN:      {}", analysis.vcn)?;
            writeln!(out, "Image:    {}", indicatif::HumanBytes(image.len() as u64))?;
            if let (Some(extent), Some(start)) = (&analysis.extent, analysis.fpt_start) {
                writeln!(out, "Engine:   0x{:X} bytes at 0x{start:X}", extent.end)?;
            }
        }

        if self.dfpt {
            self.render_tables(&mut out, image, analysis)?;
        }
        if let Some(summary) = summary {
            if !self.quiet {
                self.render_extraction(&mut out, summary)?;
            }
        }
        render_diagnostics(&mut out, &analysis.diagnostics)?;
        writeln!(out)?;
        Ok(out)
    }

    fn render_tables(&self, out: &mut String, image: &[u8], analysis: &Analysis) -> Result<()> {
        if let Some(table) = &analysis.fpt {
            writeln!(out, "\n$FPT at 0x{:X}, {} entries:", table.offset, table.entries.len())?;
            for entry in &table.entries {
                let empty = resolve::is_empty(image, table.partition_start(entry), entry.size);
                writeln!(
                    out,
                    "Name: {:<4}  Owner: {:<4}  Offset: {}  Size: {}  Empty: {}",
                    entry.name(),
                    entry.owner(),
                    display_u32(entry.offset),
                    display_u32(entry.size),
                    if empty { "Yes" } else { "No" }
                )?;
            }
        }
        if let Some(extent) = &analysis.extent {
            for part in &extent.uncharted {
                writeln!(
                    out,
                    "Name: {:<4}  Owner: ----  Offset: 0x{:08X}  Size: 0x{:08X}  Empty: No  (uncharted, instance {:04X})",
                    part.name,
                    part.start,
                    part.end.saturating_sub(part.start),
                    part.instance_id
                )?;
            }
        }
        for table in &analysis.bpdts {
            writeln!(out, "\nBPDT at 0x{:X}, {} entries:", table.offset, table.partitions.len())?;
            for part in &table.partitions {
                writeln!(
                    out,
                    "Name: {:<14}  Type: {:>2}  Partition: {:<9}  Offset: {}  Size: {}  Empty: {}",
                    part.name,
                    part.kind,
                    if part.secondary { "Secondary" } else { "Primary" },
                    display_u32(part.offset),
                    display_u32(part.size),
                    if part.is_unused() || part.is_empty(image) { "Yes" } else { "No" }
                )?;
            }
        }
        Ok(())
    }

    fn render_extraction(&self, out: &mut String, summary: &ExtractSummary) -> Result<()> {
        let green = Style::new().green();
        let red = Style::new().red();
        let magenta = Style::new().magenta();

        writeln!(out, "\nExtracted {} partition(s):", summary.partitions.len())?;
        for path in &summary.partitions {
            writeln!(out, "  {}", path.display())?;
        }
        writeln!(out, "\nExtracted {} module(s):", summary.modules.len())?;
        for module in &summary.modules {
            let verdict = match module.verdict {
                Verdict::Valid => green.apply_to(module.verdict),
                Verdict::Invalid => red.apply_to(module.verdict),
                Verdict::Unknown => magenta.apply_to(module.verdict),
            };
            writeln!(
                out,
                "  {:<4} > {:<24} {:<13} {}: {}",
                module.partition,
                module.name,
                module.compression.name(),
                module.check,
                verdict
            )?;
            if self.ext {
                if let Some(text) = &module.extensions {
                    for line in text.lines() {
                        writeln!(out, "      {line}")?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Copy a flagged image into the review folder.
    /// Writes batch reports in input order and returns how many images were
    /// flagged. A failed review copy is logged and the remaining reports
    /// are still written.
    fn report_batch(
        &self,
        output: Option<&Path>,
        images: &[PathBuf],
        results: Vec<(usize, Result<ImageReport>)>,
        out: &mut impl std::io::Write,
    ) -> Result<usize> {
        let bold_red = Style::new().bold().red();
        let mut flagged = 0;
        for (index, result) in results {
            let path = &images[index];
            match result {
                Ok(report) => {
                    out.write_all(report.text.as_bytes())?;
                    if report.flagged {
                        flagged += 1;
                        if let Err(e) = self.copy_for_review(output, path) {
                            warn!("{}: {e:#}", path.display());
                        }
                    }
                }
                Err(e) => {
                    eprintln!("{} {}: {:#}\n", bold_red.apply_to("ERROR:"), path.display(), e);
                }
            }
        }
        Ok(flagged)
    }

    fn copy_for_review(&self, output: Option<&Path>, path: &Path) -> Result<()> {
        let review = match (&self.review_dir, output) {
            (Some(dir), _) => Cow::Borrowed(dir.as_path()),
            (None, Some(base)) => Cow::Owned(base.join("review")),
            (None, None) => Cow::Owned(self.output_base()?.join("review")),
        };
        fs::create_dir_all(&review)
            .with_context(|| format!("could not create review directory: {review:?}"))?;
        let name = path.file_name().context("input path has no file name")?;
        fs::copy(path, review.join(name))
            .with_context(|| format!("failed to copy {} for review", path.display()))?;
        Ok(())
    }

    fn finish(&self, output: Option<&Path>) -> Result<()> {
        if let Some(dir) = output {
            let bold_bright_blue = Style::new().bold().blue();
            println!("Output directory: {}", bold_bright_blue.apply_to(dir.display()));
        }
        Ok(())
    }

    fn create_progress_bar(&self, len: usize) -> Result<ProgressBar> {
        let style = ProgressStyle::with_template(
            "{prefix:>16!.green.bold} [{wide_bar:.white.dim}] {pos}/{len}",
        )
        .context("unable to build progress bar template")?
        .progress_chars("=> ");
        let bar = ProgressBar::with_draw_target(
            Some(len as u64),
            ProgressDrawTarget::stderr_with_hz(PROGRESS_UPDATE_FREQUENCY),
        )
        .with_finish(ProgressFinish::AndClear)
        .with_prefix("Analyzing")
        .with_style(style);
        Ok(bar)
    }

    /// Folder the timestamped output goes into.
    fn output_base(&self) -> Result<PathBuf> {
        let now = Utc::now();
        let folder = format!("{}", now.format("meripper_%Y%m%d_%H%M%S"));
        match &self.output_dir {
            Some(output_base) => Ok(output_base.join(folder)),
            None => {
                let current_dir = env::current_dir().with_context(|| {
                    "Failed to determine current directory. Please specify --output-dir explicitly."
                })?;
                Ok(current_dir.join(folder))
            }
        }
    }

    fn create_output_dir(&self) -> Result<(Cow<'_, PathBuf>, bool)> {
        let dir: Cow<'_, PathBuf> = Cow::Owned(self.output_base()?);
        let existed = dir.as_ref().exists();
        fs::create_dir_all(dir.as_ref())
            .with_context(|| format!("could not create output directory: {dir:?}"))?;
        Ok((dir, !existed))
    }

    fn get_threadpool(&self) -> Result<ThreadPool> {
        let mut builder = ThreadPoolBuilder::new();
        if let Some(t) = self.threads {
            if t > 0 {
                builder = builder.num_threads(t);
            }
        }
        builder.build().context("unable to start threadpool")
    }
}

/// Errors, then warnings, then notes.
fn render_diagnostics(out: &mut String, diagnostics: &Diagnostics) -> Result<()> {
    if diagnostics.is_empty() {
        return Ok(());
    }
    let red = Style::new().red();
    let magenta = Style::new().magenta();
    let yellow = Style::new().yellow();

    writeln!(out)?;
    for (severity, message) in diagnostics.iter() {
        let line = format!("{severity}: {message}");
        match severity {
            Severity::Error => writeln!(out, "{}", red.apply_to(line))?,
            Severity::Warning => writeln!(out, "{}", magenta.apply_to(line))?,
            Severity::Note => writeln!(out, "{}", yellow.apply_to(line))?,
        }
    }
    Ok(())
}

// Friendlier, task-oriented help template shown for -h/--help
const FRIENDLY_HELP: &str = color_print::cstr!(
    "\
{before-help}<bold><underline>{name} {version}</underline></bold>
{about}

Quick start:
  - Show family, version and integrity of a firmware image:
    meripper [me.bin]

Common tasks:
  - Scan a whole folder, 8 images at a time:
    meripper [dumps/] -t 8
  - Extract partitions and modules into a timestamped folder:
    meripper [me.bin] -x
  - Show the partition tables:
    meripper [me.bin] --dfpt
  - Decode Huffman modules while extracting:
    meripper [me.bin] -x --huffman-dict [huffman.txt]

Integrity:
  - Manifests are RSA checked, modules are hash or checksum checked.
  - A failed check is reported, never fatal; the data is still extracted.
  - In batch mode, images with messages are copied to a review folder.

Logging:
  - -v / -vv raise the log level, MERIPPER_LOG takes a full filter.

{usage-heading}
{usage}

Options:
{all-args}
{after-help}"
);
