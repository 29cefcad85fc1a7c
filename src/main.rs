use std::path::Path;

use clap::Parser;

use hostkit::cli::{Cli, Command, HostCommand, VmCommand, VmResources, VmTarget};
use hostkit::config::{self, Environment, Settings};
use hostkit::error::HostkitError;
use hostkit::host::disk::{DiskProvisioner, SystemProbe};
use hostkit::host::doas::DoasSetup;
use hostkit::host::network::{self, NetworkManager};
use hostkit::host::units;
use hostkit::host::users::UserProvisioner;
use hostkit::host::preflight;
use hostkit::host::services::ServiceSetup;
use hostkit::logging::{self, LogFileHandle, Verbosity};
use hostkit::runner::SystemRunner;
use hostkit::vm::VmSpec;
use hostkit::vm::lifecycle::VmController;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let verbosity = if cli.quiet {
        Verbosity::Quiet
    } else if cli.verbose {
        Verbosity::Verbose
    } else {
        Verbosity::Normal
    };
    let log_file = logging::init(verbosity);

    if let Err(err) = run(cli, &log_file).await {
        let code = err.exit_code();
        tracing::debug!(error = %err, code, "exiting with failure");
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

async fn run(cli: Cli, log_file: &LogFileHandle) -> Result<(), HostkitError> {
    match cli.command {
        Command::Vm { action } => {
            // The guest spec is checked before anything is read from disk.
            let spec = vm_spec(&action)?;
            let settings = load(cli.config.as_deref())?;
            settings.vm_folder()?;
            start_file_log(&settings, log_file);
            let runner = SystemRunner;
            let controller = VmController::new(&runner, &settings);
            match action {
                VmCommand::Create { .. } => {
                    let dir = controller.create(&spec).await?;
                    println!("Created VM '{}' in {}", spec.name, dir.path().display());
                }
                VmCommand::Setup { .. } => controller.setup(&spec).await?,
                VmCommand::Run { .. } => controller.run(&spec).await?,
            }
        }
        Command::Host { action } => {
            let settings = load(cli.config.as_deref())?;
            start_file_log(&settings, log_file);
            host(action, &settings).await?;
        }
    }
    Ok(())
}

fn vm_spec(action: &VmCommand) -> Result<VmSpec, HostkitError> {
    let target = |t: &VmTarget| VmSpec::new(&t.arch, &t.name);
    let resources = |spec: VmSpec, r: &VmResources| spec.cores(r.cores)?.memory(&r.memory);
    match action {
        VmCommand::Create { target: t, size } => target(t)?.disk_size(size),
        VmCommand::Setup {
            target: t,
            resources: r,
        } => resources(target(t)?, r),
        VmCommand::Run {
            target: t,
            resources: r,
            kernel,
        } => Ok(resources(target(t)?, r)?.kernel(kernel.clone())),
    }
}

fn load(explicit: Option<&Path>) -> Result<Settings, HostkitError> {
    config::load_settings(explicit, &Environment::capture())
}

fn start_file_log(settings: &Settings, log_file: &LogFileHandle) {
    if let Some(path) = &settings.log_file
        && let Err(e) = log_file.set_file(path)
    {
        tracing::warn!(path = %path.display(), error = %e, "file logging disabled");
    }
}

async fn host(action: HostCommand, settings: &Settings) -> Result<(), HostkitError> {
    let runner = SystemRunner;
    match action {
        HostCommand::StaticIp { ip } => {
            let manager = NetworkManager::new(&runner, &settings.network);
            let target = match ip {
                Some(ip) => ip,
                None => {
                    let hostname = manager.hostname().await?;
                    network::resolve_target(None, &hostname, &settings.network.hosts)?
                }
            };
            let conn = manager.reconfigure(&target).await?;
            println!("'{}' on {} is now {target}", conn.name, conn.interface);
        }
        HostCommand::Partition {
            device,
            folder,
            user,
        } => {
            let owner = if folder == Path::new("/home") {
                None
            } else {
                Some(settings.user(user.as_deref())?)
            };
            let target = DiskProvisioner::new(
                &runner,
                &settings.disk,
                SystemProbe::new(&settings.disk.mount_table),
            )
            .provision(&device, &folder, owner.as_deref())
            .await?;
            println!(
                "Mounted {} (UUID={}) at {}",
                target.volume_path.display(),
                target.uuid,
                target.mountpoint.display()
            );
        }
        HostCommand::CreateUser { user, password } => {
            let name = settings.user(user.as_deref())?;
            let password = match password {
                Some(p) => p,
                None => prompt_password(&name)?,
            };
            UserProvisioner::new(&runner)?.create(&name, &password).await?;
            println!("Created user '{name}'");
        }
        HostCommand::Doas => {
            DoasSetup::new(&runner, &settings.host).apply().await?;
            println!("doas configured, sudo now points at doas");
        }
        HostCommand::MountUnits { from, units } => {
            let installed =
                units::install_mount_units(&runner, &from, &settings.host.systemd_dir, &units)
                    .await?;
            for path in installed {
                println!("{}", path.display());
            }
        }
        HostCommand::Preflight => {
            let release = preflight::run(&settings.host, preflight::effective_uid())?;
            println!(
                "{} {}: ok",
                release.get("NAME").or(release.id()).unwrap_or("unknown OS"),
                release.get("VERSION_ID").unwrap_or_default()
            );
        }
        HostCommand::Libvirt { user } => {
            let name = settings.user(user.as_deref())?;
            if ServiceSetup::new(&runner, &settings.host).libvirt(&name).await? {
                println!("'{name}' can now manage system VMs");
            } else {
                println!("virt-install is not installed, nothing to do");
            }
        }
        HostCommand::ResizeRootfs => {
            match ServiceSetup::new(&runner, &settings.host)
                .resize_rootfs()
                .await?
            {
                Some(volume) => println!("Grew {} ({})", volume.device, volume.fs_type),
                None => println!("/ is not on a logical volume, nothing to do"),
            }
        }
        HostCommand::Mosh => {
            if ServiceSetup::new(&runner, &settings.host).mosh().await? {
                println!("Opened mosh ports in firewalld");
            } else {
                println!("firewalld is not installed, nothing to do");
            }
        }
        HostCommand::Podman { user } => {
            let name = settings.user(user.as_deref())?;
            ServiceSetup::new(&runner, &settings.host).podman(&name)?;
            println!("Wrote subordinate id ranges for '{name}'");
        }
    }
    Ok(())
}

fn prompt_password(user: &str) -> Result<String, HostkitError> {
    inquire::Password::new(&format!("Password for {user}:"))
        .prompt()
        .map_err(|e| match e {
            inquire::InquireError::OperationCanceled
            | inquire::InquireError::OperationInterrupted => HostkitError::PromptCancelled,
            other => HostkitError::Validation {
                message: format!("prompt error: {other}"),
            },
        })
}
