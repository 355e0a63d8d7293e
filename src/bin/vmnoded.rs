//! Agent daemon: production wiring over libvirt and Redis.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use vmnode::bus::redis::RedisBus;
use vmnode::config::{AgentConfig, Cli};
use vmnode::hypervisor::libvirt::{LibvirtConnection, LibvirtEventLoop};
use vmnode::inspect::guestfish::GuestfishFactory;
use vmnode::ssh::SshRemoteExec;
use vmnode::storage::{FuseMounter, StorageManager};
use vmnode::supervisor::{self, Collaborators};
use vmnode::util::PidFile;

fn main() {
    if let Err(e) = run() {
        eprintln!("vmnoded: {e:#}");
        tracing::error!(error = %format!("{e:#}"), "fatal");
        std::process::exit(-1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = AgentConfig::load(&cli.config).context("loading configuration")?;
    cfg.apply_cli(&cli);

    // Fork before the runtime exists; tokio threads do not survive it.
    if cfg.daemon {
        daemonize::Daemonize::new()
            .working_directory("/")
            .start()
            .context("daemonizing")?;
    }

    let log_file = if cfg.daemon { cfg.log_file.as_deref() } else { None };
    let _log_guard = vmnode::logging::init(cfg.debug, log_file);

    let _pidfile = PidFile::create(&cfg.pidfile).context("creating pid file")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting runtime")?;

    runtime.block_on(async move {
        let bus = Arc::new(
            RedisBus::connect(&cfg.bus_url)
                .await
                .context("connecting to message bus")?,
        );
        let conn =
            LibvirtConnection::open(&cfg.hypervisor_uri).context("opening hypervisor")?;
        let storage = Arc::new(StorageManager::new(
            cfg.qemu_img.clone(),
            Arc::new(FuseMounter::new(cfg.dfs_mount_root.clone())),
        ));
        let remote = Arc::new(SshRemoteExec::new(cfg.ssh_user.clone(), cfg.ssh_key.clone()));

        let collaborators = Collaborators {
            conn,
            event_loop: Arc::new(LibvirtEventLoop),
            bus,
            storage,
            inspectors: Arc::new(GuestfishFactory),
            remote,
        };
        supervisor::run(Arc::new(cfg), collaborators, CancellationToken::new())
            .await
            .context("running agent")?;
        Ok(())
    })
}
