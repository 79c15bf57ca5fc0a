use std::net::SocketAddr;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use fleet_dispatch::config::{DispatchConfig, ServerConfig};
use fleet_dispatch::node::Node;
use fleet_dispatch::registry::{HostRegistration, HostSpec, ServiceRegistration};
use fleet_dispatch::remote::{HttpTransport, RemoteConfig, RemoteRegistry};
use fleet_dispatch::scheduler::{CountFilter, Job, JobId, JobStatus, NewJob, SystemLoad};
use fleet_dispatch::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "fleet-dispatch")]
#[command(version)]
#[command(about = "Job dispatch and service health registry for a fleet of worker hosts")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a registry server
    Server(ServerArgs),

    /// Host management commands
    Host {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: HostCommands,
    },

    /// Service registration commands
    Service {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ServiceCommands,
    },

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Host load commands
    Load {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: LoadCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to serve the registry API on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Public base URL of this server (defaults to http://<listen>)
    #[arg(long)]
    host_url: Option<String>,

    /// Maximum number of jobs kept in the store
    #[arg(long, default_value = "100000")]
    max_jobs: usize,

    /// Pause between dispatch cycles in milliseconds
    #[arg(long, default_value = "1000")]
    dispatch_interval_ms: u64,

    /// Fail jobs that found no eligible host for this long (milliseconds)
    #[arg(long)]
    max_dispatch_wait_ms: Option<u64>,

    /// Remove job trees unchanged for this many seconds
    #[arg(long)]
    job_lifetime_secs: Option<u64>,

    /// Pause between retention sweeps in milliseconds
    #[arg(long, default_value = "60000")]
    maintenance_interval_ms: u64,
}

// =============================================================================
// Client Arguments (shared by all client commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Registry server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Base URL of the host issuing the commands
    #[arg(long, default_value = "http://127.0.0.1")]
    server_url: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Host Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum HostCommands {
    /// List registered hosts
    List,
    /// Register a host or refresh its capacity
    Register {
        host: String,
        #[arg(long, default_value = "")]
        address: String,
        #[arg(long, default_value = "0")]
        memory: u64,
        #[arg(long, default_value = "1")]
        cores: u32,
        #[arg(long, default_value = "1.0")]
        max_load: f32,
    },
    /// Remove a host and its services
    Unregister { host: String },
    /// Bring a host back online
    Enable { host: String },
    /// Take a host offline
    Disable { host: String },
    /// Toggle maintenance mode
    Maintenance {
        host: String,
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

// =============================================================================
// Service Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ServiceCommands {
    /// List service registrations
    List {
        #[arg(long)]
        host: Option<String>,
        #[arg(long = "type")]
        service_type: Option<String>,
    },
    /// Register a service on a host
    Register {
        service_type: String,
        host: String,
        #[arg(long, default_value = "")]
        path: String,
        #[arg(long)]
        job_producer: bool,
    },
    /// Remove a service registration
    Unregister { service_type: String, host: String },
    /// Registrations able to take work, best target first
    Available { service_type: String },
    /// Reset a service to NORMAL health
    Sanitize { service_type: String, host: String },
    /// Per-service job statistics
    Stats,
    /// Number of services not in NORMAL health
    Warnings,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        job_type: String,
        operation: String,
        /// Job arguments, in order
        args: Vec<String>,
        #[arg(long)]
        payload: Option<String>,
        #[arg(long, default_value = "1.0")]
        load: f32,
        #[arg(long)]
        parent: Option<JobId>,
    },
    /// Show a job
    Status { job_id: JobId },
    /// List the children of a job
    Children { job_id: JobId },
    /// List jobs of a service type
    List {
        service_type: String,
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// List jobs that have not finished
    Active,
    /// Cancel a job
    Cancel { job_id: JobId },
    /// Delete a job
    Remove { job_id: JobId },
    /// Payloads of all jobs of an operation
    Payloads { operation: String },
    /// Count jobs
    Count {
        #[arg(long = "type")]
        service_type: Option<String>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        operation: Option<String>,
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// Remove job trees unchanged for the given number of seconds
    Cleanup { lifetime_secs: u64 },
}

// =============================================================================
// Load Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum LoadCommands {
    /// Current load of every host
    Current,
    /// Capacity of every host, or of one
    Max {
        #[arg(long)]
        host: Option<String>,
    },
}

// =============================================================================
// Output Helpers
// =============================================================================

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_hosts(hosts: &[HostRegistration], output: &OutputFormat) -> CliResult {
    match output {
        OutputFormat::Json => print_json(&hosts)?,
        OutputFormat::Table => {
            if hosts.is_empty() {
                println!("No hosts registered.");
                return Ok(());
            }
            println!(
                "{:<32} {:<6} {:<9} {:<7} MAINTENANCE",
                "HOST", "CORES", "MAX LOAD", "ONLINE"
            );
            println!("{}", "-".repeat(70));
            for host in hosts {
                println!(
                    "{:<32} {:<6} {:<9.1} {:<7} {}",
                    host.host, host.cores, host.max_load, host.online, host.maintenance
                );
            }
        }
    }
    Ok(())
}

fn print_services(services: &[ServiceRegistration], output: &OutputFormat) -> CliResult {
    match output {
        OutputFormat::Json => print_json(&services)?,
        OutputFormat::Table => {
            if services.is_empty() {
                println!("No services found.");
                return Ok(());
            }
            println!("{:<28} {:<32} {:<8} ONLINE", "TYPE", "HOST", "HEALTH");
            println!("{}", "-".repeat(78));
            for service in services {
                println!(
                    "{:<28} {:<32} {:<8} {}",
                    service.service_type, service.host, service.health, service.online
                );
            }
        }
    }
    Ok(())
}

fn print_job(job: &Job, output: &OutputFormat) -> CliResult {
    match output {
        OutputFormat::Json => print_json(job)?,
        OutputFormat::Table => {
            println!("Job ID:          {}", job.id);
            println!("Type:            {}", job.job_type);
            println!("Operation:       {}", job.operation);
            println!("Status:          {}", job.status);
            println!("Load:            {}", job.job_load);
            println!("Creator:         {}", job.creator_host);
            if let Some(host) = &job.processing_host {
                println!("Processing Host: {}", host);
            }
            if let Some(parent) = job.parent_id {
                println!("Parent:          {}", parent);
            }
            if !job.arguments.is_empty() {
                println!("Arguments:       {}", job.arguments.join(" "));
            }
            if let Some(reason) = &job.failure_reason {
                println!("Failure:         {}", reason);
            }
        }
    }
    Ok(())
}

fn print_jobs(jobs: &[Job], output: &OutputFormat) -> CliResult {
    match output {
        OutputFormat::Json => print_json(&jobs)?,
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<10} {:<12} {:<24} {:<20} HOST",
                "JOB ID", "STATUS", "TYPE", "OPERATION"
            );
            println!("{}", "-".repeat(90));
            for job in jobs {
                println!(
                    "{:<10} {:<12} {:<24} {:<20} {}",
                    job.id,
                    job.status,
                    job.job_type,
                    job.operation,
                    job.processing_host.as_deref().unwrap_or("-")
                );
            }
            println!();
            println!("{} job(s)", jobs.len());
        }
    }
    Ok(())
}

fn print_load(load: &SystemLoad, output: &OutputFormat) -> CliResult {
    match output {
        OutputFormat::Json => print_json(load)?,
        OutputFormat::Table => {
            println!("{:<32} {:<6} {:<9} {:<9} FACTOR", "HOST", "JOBS", "LOAD", "MAX");
            println!("{}", "-".repeat(68));
            for node in load.nodes() {
                println!(
                    "{:<32} {:<6} {:<9.2} {:<9.2} {:.2}",
                    node.host,
                    node.running_jobs,
                    node.current_load,
                    node.max_load,
                    node.load_factor()
                );
            }
        }
    }
    Ok(())
}

fn print_count(count: u64, output: &OutputFormat) -> CliResult {
    match output {
        OutputFormat::Json => print_json(&serde_json::json!({ "count": count })),
        OutputFormat::Table => {
            println!("{}", count);
            Ok(())
        }
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> CliResult {
    let dispatch = DispatchConfig {
        dispatch_interval_ms: args.dispatch_interval_ms,
        max_dispatch_wait_ms: args.max_dispatch_wait_ms,
        job_lifetime_secs: args.job_lifetime_secs,
        maintenance_interval_ms: args.maintenance_interval_ms,
    };
    dispatch.validate()?;

    let mut config = ServerConfig::new(args.listen)
        .with_max_jobs(args.max_jobs)
        .with_dispatch(dispatch);
    if let Some(host_url) = args.host_url {
        config = config.with_host_url(host_url);
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        host_url = %config.host_url,
        max_jobs = config.max_jobs,
        dispatch_interval_ms = config.dispatch.dispatch_interval_ms,
        "Starting fleet-dispatch server"
    );

    let shutdown = install_shutdown_handler()?;
    let node = Node::new(config)?;
    node.run(shutdown).await
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn connect(
    client: &ClientArgs,
) -> Result<RemoteRegistry<HttpTransport>, Box<dyn std::error::Error>> {
    let config = RemoteConfig::new(client.addr.clone(), client.server_url.clone());
    Ok(RemoteRegistry::new(HttpTransport::new()?, config)?)
}

async fn handle_host(client: &ClientArgs, command: HostCommands) -> CliResult {
    let registry = connect(client)?;
    let output = &client.output;

    match command {
        HostCommands::List => print_hosts(&registry.host_registrations().await?, output)?,
        HostCommands::Register {
            host,
            address,
            memory,
            cores,
            max_load,
        } => {
            let spec = HostSpec::new(host.clone(), max_load)
                .with_address(address)
                .with_resources(memory, cores);
            registry.register_host(&spec).await?;
            println!("Host {} registered", host);
        }
        HostCommands::Unregister { host } => {
            registry.unregister_host(&host).await?;
            println!("Host {} unregistered", host);
        }
        HostCommands::Enable { host } => {
            registry.enable_host(&host).await?;
            println!("Host {} enabled", host);
        }
        HostCommands::Disable { host } => {
            registry.disable_host(&host).await?;
            println!("Host {} disabled", host);
        }
        HostCommands::Maintenance { host, enabled } => {
            registry.set_maintenance(&host, enabled).await?;
            println!("Host {} maintenance: {}", host, enabled);
        }
    }
    Ok(())
}

async fn handle_service(client: &ClientArgs, command: ServiceCommands) -> CliResult {
    let registry = connect(client)?;
    let output = &client.output;

    match command {
        ServiceCommands::List { host, service_type } => {
            let services = match (service_type, host) {
                (Some(service_type), Some(host)) => registry
                    .service_registration(&service_type, &host)
                    .await?
                    .into_iter()
                    .collect(),
                (Some(service_type), None) => registry.services_by_type(&service_type).await?,
                (None, Some(host)) => registry.services_by_host(&host).await?,
                (None, None) => registry.service_registrations().await?,
            };
            print_services(&services, output)?;
        }
        ServiceCommands::Register {
            service_type,
            host,
            path,
            job_producer,
        } => {
            let registration = registry
                .register_service(&service_type, &host, &path, job_producer)
                .await?;
            print_services(&[registration], output)?;
        }
        ServiceCommands::Unregister { service_type, host } => {
            registry.unregister_service(&service_type, &host).await?;
            println!("Service {} on {} unregistered", service_type, host);
        }
        ServiceCommands::Available { service_type } => {
            print_services(&registry.services_by_load(&service_type).await?, output)?;
        }
        ServiceCommands::Sanitize { service_type, host } => {
            registry.sanitize(&service_type, &host).await?;
            println!("Service {} on {} sanitized", service_type, host);
        }
        ServiceCommands::Stats => {
            let stats = registry.statistics().await?;
            match output {
                OutputFormat::Json => print_json(&stats)?,
                OutputFormat::Table => {
                    println!(
                        "{:<24} {:<28} {:<8} {:<8} {:<8} {:<10} QUEUE MS",
                        "TYPE", "HOST", "RUNNING", "QUEUED", "DONE", "RUN MS"
                    );
                    println!("{}", "-".repeat(100));
                    for s in &stats {
                        println!(
                            "{:<24} {:<28} {:<8} {:<8} {:<8} {:<10} {}",
                            s.service.service_type,
                            s.service.host,
                            s.running_jobs,
                            s.queued_jobs,
                            s.finished_jobs,
                            s.mean_run_time_ms,
                            s.mean_queue_time_ms
                        );
                    }
                }
            }
        }
        ServiceCommands::Warnings => {
            print_count(registry.count_of_abnormal_services().await?, output)?;
        }
    }
    Ok(())
}

async fn handle_job(client: &ClientArgs, command: JobCommands) -> CliResult {
    let registry = connect(client)?;
    let output = &client.output;

    match command {
        JobCommands::Submit {
            job_type,
            operation,
            args,
            payload,
            load,
            parent,
        } => {
            let mut request = NewJob::new(job_type, operation)
                .with_arguments(args)
                .with_load(load);
            if let Some(payload) = payload {
                request = request.with_payload(payload);
            }
            if let Some(parent) = parent {
                request = request.with_parent(parent);
            }
            print_job(&registry.create_job(&request).await?, output)?;
        }
        JobCommands::Status { job_id } => print_job(&registry.get_job(job_id).await?, output)?,
        JobCommands::Children { job_id } => {
            print_jobs(&registry.child_jobs(job_id).await?, output)?
        }
        JobCommands::List {
            service_type,
            status,
        } => print_jobs(&registry.jobs(&service_type, status).await?, output)?,
        JobCommands::Active => print_jobs(&registry.active_jobs().await?, output)?,
        JobCommands::Cancel { job_id } => print_job(&registry.cancel_job(job_id).await?, output)?,
        JobCommands::Remove { job_id } => {
            registry.remove_job(job_id).await?;
            println!("Job {} removed", job_id);
        }
        JobCommands::Payloads { operation } => {
            let payloads = registry.job_payloads(&operation).await?;
            match output {
                OutputFormat::Json => print_json(&payloads)?,
                OutputFormat::Table => payloads.iter().for_each(|p| println!("{}", p)),
            }
        }
        JobCommands::Count {
            service_type,
            host,
            operation,
            status,
        } => {
            let filter = CountFilter {
                service_type,
                host,
                operation,
                status,
            };
            print_count(registry.count(&filter).await?, output)?;
        }
        JobCommands::Cleanup { lifetime_secs } => {
            registry.remove_parentless_jobs(lifetime_secs).await?;
            println!("Removed job trees older than {}s", lifetime_secs);
        }
    }
    Ok(())
}

async fn handle_load(client: &ClientArgs, command: LoadCommands) -> CliResult {
    let registry = connect(client)?;
    let load: SystemLoad = match command {
        LoadCommands::Current => registry.current_load().await?,
        LoadCommands::Max { host: Some(host) } => {
            std::iter::once(registry.max_load_on_node(&host).await?).collect()
        }
        LoadCommands::Max { host: None } => registry.max_loads().await?,
    };
    print_load(&load, &client.output)
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Host { client, command } => handle_host(&client, command).await?,
        Commands::Service { client, command } => handle_service(&client, command).await?,
        Commands::Job { client, command } => handle_job(&client, command).await?,
        Commands::Load { client, command } => handle_load(&client, command).await?,
    }

    Ok(())
}
