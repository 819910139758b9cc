use std::path::PathBuf;
use std::process;

use clap::{crate_version, Arg, ArgAction, Command};
use fuser::MountOption;
use log::{error, LevelFilter};

use wolfs::{MountDirs, WolfsFs, WolfsOptions, DEFAULT_CACHE_SIZE_MB};

fn cli() -> Command {
    Command::new("wolfs")
        .version(crate_version!())
        .about("Caching FUSE filesystem for slow or sometimes-offline sources")
        .arg(Arg::new("source").required(true).help("Directory tree to mirror"))
        .arg(
            Arg::new("mountpoint")
                .required(true)
                .help("Where to mount the file system"),
        )
        .arg(
            Arg::new("cache")
                .required(true)
                .help("Local datastore of the remote directory"),
        )
        .arg(
            Arg::new("metadb")
                .long("metadb")
                .value_name("PATH")
                .help("Inode-table snapshot kept between mounts"),
        )
        .arg(
            Arg::new("log")
                .long("log")
                .value_name("PATH")
                .help("File the journal is dumped to on flush"),
        )
        .arg(
            Arg::new("size")
                .long("size")
                .value_name("MIB")
                .default_value("512")
                .help("Size of the cache in Megabytes"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Enable debugging output"),
        )
        .arg(
            Arg::new("debug-fuse")
                .long("debug-fuse")
                .action(ArgAction::SetTrue)
                .help("Enable FUSE debugging output"),
        )
}

fn main() {
    let matches = match cli().try_get_matches() {
        Ok(m) => m,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            process::exit(libc::EINVAL);
        }
        Err(e) => {
            // --help / --version
            let _ = e.print();
            return;
        }
    };

    let debug = matches.get_flag("debug");
    env_logger::builder()
        .format_timestamp_millis()
        .filter_level(if debug { LevelFilter::Debug } else { LevelFilter::Info })
        .init();

    let max_cache_mb: u64 = match matches.get_one::<String>("size").unwrap().parse() {
        Ok(n) => n,
        Err(_) => {
            error!("--size must be a number of Megabytes");
            process::exit(libc::EINVAL);
        }
    };

    let source = matches.get_one::<String>("source").unwrap();
    let mountpoint = matches.get_one::<String>("mountpoint").unwrap();
    let cache = matches.get_one::<String>("cache").unwrap();

    let dirs = match MountDirs::new(source.as_str(), cache.as_str(), mountpoint.as_str()) {
        Ok(dirs) => dirs,
        Err(e) => {
            error!("{e}");
            process::exit(libc::ENOENT);
        }
    };
    let mount_dir = dirs.mount_dir.clone();

    let opts = WolfsOptions {
        max_cache_mb: if max_cache_mb == 0 { DEFAULT_CACHE_SIZE_MB } else { max_cache_mb },
        noatime: true,
        metadb: matches.get_one::<String>("metadb").map(PathBuf::from),
        journal_log: matches.get_one::<String>("log").map(PathBuf::from),
    };

    let fs = match WolfsFs::new(dirs, opts) {
        Ok(fs) => fs,
        Err(e) => {
            error!("{e}");
            process::exit(libc::ENOENT);
        }
    };

    let mut options = vec![
        MountOption::FSName("wolfs".to_string()),
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
    ];
    if matches.get_flag("debug-fuse") {
        options.push(MountOption::CUSTOM("debug".to_string()));
    }

    if let Err(e) = fuser::mount2(fs, &mount_dir, &options) {
        error!("{e}");
        process::exit(libc::EIO);
    }
}
