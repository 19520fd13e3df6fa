use anyhow::{Context, Result};
use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "osync",
    about = "`osync` synchronizes a keyed object namespace from a source store to a destination \
    store, reconciling differences incrementally. Stores are addressed as scheme://location, \
    e.g. file:///data/photos or mem://scratch."
)]
struct Args {
    /// Source store URI
    #[structopt()]
    src: String,

    /// Destination store URI
    #[structopt()]
    dst: String,

    /// First key to sync (inclusive)
    #[structopt(long, default_value = "")]
    start: String,

    /// Last key to sync (inclusive)
    #[structopt(long, default_value = "")]
    end: String,

    /// Number of concurrent workers
    #[structopt(long, default_value = "10")]
    threads: usize,

    /// Number of concurrent listers for the prefix fan-out
    #[structopt(long, default_value = "1")]
    list_threads: usize,

    /// Depth of the parallel listing recursion
    #[structopt(long, default_value = "1")]
    list_depth: u32,

    /// Maximum number of objects to sync, -1 means unlimited
    #[structopt(long, default_value = "-1")]
    limit: i64,

    /// Bandwidth limit per second, e.g. "10MB"; 0 disables throttling
    #[structopt(long, default_value = "0")]
    bwlimit: bytesize::ByteSize,

    /// Stop the process after this many objects failed, 0 means never
    #[structopt(long, default_value = "0")]
    max_failure: u64,

    /// Skip objects smaller than this
    #[structopt(long, default_value = "0")]
    min_size: bytesize::ByteSize,

    /// Skip objects larger than this
    #[structopt(long)]
    max_size: Option<bytesize::ByteSize>,

    /// Skip objects modified less than this many seconds before the run
    #[structopt(long)]
    min_age: Option<u64>,

    /// Skip objects modified more than this many seconds before the run
    #[structopt(long)]
    max_age: Option<u64>,

    /// Only sync objects modified after this RFC 3339 time
    #[structopt(long)]
    start_time: Option<String>,

    /// Only sync objects modified before this RFC 3339 time
    #[structopt(long)]
    end_time: Option<String>,

    /// Replicate symlinks instead of following them
    #[structopt(long)]
    links: bool,

    /// Sync directory entries too
    #[structopt(long)]
    dirs: bool,

    /// Propagate POSIX owner, group and mode
    #[structopt(long)]
    perms: bool,

    /// Don't actually copy or delete anything
    #[structopt(long)]
    dry: bool,

    /// Delete source objects once a verified copy exists
    #[structopt(long)]
    delete_src: bool,

    /// Delete destination objects with no source counterpart
    #[structopt(long)]
    delete_dst: bool,

    /// Only copy keys that already exist on the destination
    #[structopt(long)]
    existing: bool,

    /// Never overwrite keys that already exist on the destination
    #[structopt(long)]
    ignore_existing: bool,

    /// Copy only when the source mtime is newer
    #[structopt(short = "u", long)]
    update: bool,

    /// Copy unconditionally without listing the destination
    #[structopt(short = "f", long)]
    force_update: bool,

    /// Verify checksums of all objects that look equal
    #[structopt(long)]
    check_all: bool,

    /// Verify every newly copied object against the source checksum
    #[structopt(long)]
    check_new: bool,

    /// Re-check the source after copying to detect mid-sync changes
    #[structopt(long)]
    check_change: bool,

    /// Match include/exclude rules against the whole key path
    #[structopt(long)]
    match_full_path: bool,

    /// Ask drivers to write objects in place rather than via rename
    #[structopt(long)]
    inplace: bool,

    /// Include objects matching PATTERN (order relative to --exclude matters)
    #[structopt(long, number_of_values = 1)]
    include: Vec<String>,

    /// Exclude objects matching PATTERN (order relative to --include matters)
    #[structopt(long, number_of_values = 1)]
    exclude: Vec<String>,

    /// Sync only the keys/prefixes listed in this file, one per line;
    /// a trailing slash marks a prefix
    #[structopt(long)]
    files_from: Option<std::path::PathBuf>,

    /// Address of a remote manager dispatching tasks to this process
    #[structopt(long)]
    manager: Option<String>,

    /// Worker address a manager would dispatch to (repeatable)
    #[structopt(long, number_of_values = 1)]
    worker: Vec<String>,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: WARN)
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,

    /// Quiet mode, only report errors
    #[structopt(short = "q", long)]
    quiet: bool,
}

fn parse_time(value: &str) -> Result<std::time::SystemTime> {
    let parsed = chrono::DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("{:?} is not an RFC 3339 time", value))?;
    Ok(parsed.with_timezone(&chrono::Utc).into())
}

fn build_config(args: &Args, raw_args: &[String]) -> Result<common::Config> {
    let rules = if args.include.is_empty() && args.exclude.is_empty() {
        Vec::new()
    } else {
        // order between --include and --exclude matters, so the rules are
        // re-extracted from the raw argument list
        common::parse_rule_args(raw_args)
    };
    Ok(common::Config {
        start: args.start.clone(),
        end: args.end.clone(),
        threads: args.threads,
        list_threads: args.list_threads,
        list_depth: args.list_depth,
        limit: args.limit,
        bw_limit: args.bwlimit.0,
        max_failure: args.max_failure,
        min_size: args.min_size.0,
        max_size: args.max_size.map(|s| s.0).unwrap_or(u64::MAX),
        min_age: args.min_age.map(std::time::Duration::from_secs),
        max_age: args.max_age.map(std::time::Duration::from_secs),
        start_time: args.start_time.as_deref().map(parse_time).transpose()?,
        end_time: args.end_time.as_deref().map(parse_time).transpose()?,
        links: args.links,
        dirs: args.dirs,
        perms: args.perms,
        dry: args.dry,
        delete_src: args.delete_src,
        delete_dst: args.delete_dst,
        existing: args.existing,
        ignore_existing: args.ignore_existing,
        update: args.update,
        force_update: args.force_update,
        check_all: args.check_all,
        check_new: args.check_new,
        check_change: args.check_change,
        match_full_path: args.match_full_path,
        inplace: args.inplace,
        verbose: args.verbose,
        quiet: args.quiet,
        manager: args.manager.clone(),
        workers: args.worker.clone(),
        files_from: args.files_from.clone(),
        rules,
        registry: None,
    })
}

fn setup_tracing(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args, raw_args: Vec<String>) -> Result<common::Summary> {
    if args.delete_src && args.delete_dst {
        anyhow::bail!("--delete-src and --delete-dst are mutually exclusive");
    }
    let src = common::from_uri(&args.src)
        .with_context(|| format!("source {:?}", args.src))?;
    let dst = common::from_uri(&args.dst)
        .with_context(|| format!("destination {:?}", args.dst))?;
    let config = build_config(&args, &raw_args)?;
    common::sync(src, dst, config).await
}

fn main() {
    let raw_args: Vec<String> = std::env::args().collect();
    let args = Args::from_args();
    setup_tracing(args.verbose, args.quiet);
    let quiet = args.quiet;
    let runtime = tokio::runtime::Runtime::new().expect("failed to start runtime");
    match runtime.block_on(run(args, raw_args)) {
        Ok(summary) => {
            if !quiet {
                println!("{}", summary);
            }
        }
        Err(err) => {
            tracing::error!("{:#}", err);
            std::process::exit(1);
        }
    }
}
