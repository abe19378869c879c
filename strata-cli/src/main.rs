mod agent_client;
mod failure;
mod render;

use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use strata_integrations::{
    BackendUpdateRequest, FilterRequest, NewBackendRequest, SyncConfigRequest,
};

use agent_client::AgentClient;

/// Command surface of the strata agent.
#[derive(Parser, Debug)]
#[command(name = "strata", version)]
#[command(about = "Unified object-storage namespace with tag filters and sync")]
struct Cli {
    /// Print raw JSON instead of formatted lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Virtual filesystem verbs
    #[command(subcommand)]
    Vfs(VfsCommand),
    /// Tag verbs
    #[command(subcommand)]
    Tag(TagCommand),
    /// Filter verbs
    #[command(subcommand)]
    Filter(FilterCommand),
    /// Backend verbs
    #[command(subcommand)]
    Backend(BackendCommand),
    /// Sync configuration verbs
    #[command(subcommand)]
    Sync(SyncCommand),
}

#[derive(Subcommand, Debug)]
enum VfsCommand {
    /// List a virtual path (root, backend path, `filters` or a filter)
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Exit with 0 when the path exists, 3 otherwise
    Test { path: String },
    /// Update or create the object and its metadata
    Touch { path: String },
    /// Remove an object or directory
    Rm {
        path: String,
        /// Remove directories and their contents
        #[arg(short, long)]
        recursive: bool,
        /// Confirm wiping every object of a backend
        #[arg(long)]
        yes: bool,
    },
    /// Create a directory prefix, including missing parents
    Mkdir { path: String },
}

#[derive(Subcommand, Debug)]
enum TagCommand {
    /// Attach key=value to a file
    Add { path: String, key: String, value: String },
    /// Show the tags of a file
    List { path: String },
    /// Detach a tag; without a value every value of the key is removed
    Rm {
        path: String,
        key: String,
        value: Option<String>,
    },
    /// Find files carrying a tag
    Search { key: String, value: Option<String> },
    /// Derive mime, ext and year tags for a file or every file under a prefix
    Auto { path: String },
}

#[derive(Args, Debug)]
struct FilterFields {
    /// Display name (defaults to the path)
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Subcommand, Debug)]
enum FilterCommand {
    /// Store a named query under `filters/<path>`
    Create {
        path: String,
        query: String,
        #[command(flatten)]
        fields: FilterFields,
    },
    List,
    Show { path: String },
    /// Replace the query of a filter, optionally moving it
    Update {
        path: String,
        query: String,
        /// New virtual path
        #[arg(long = "move-to")]
        move_to: Option<String>,
        #[command(flatten)]
        fields: FilterFields,
    },
    Delete { path: String },
    /// Evaluate a query without storing it
    Test { query: String },
}

#[derive(Subcommand, Debug)]
enum BackendCommand {
    /// Register an S3-compatible backend (`memory://<name>` for an in-process store)
    Provision {
        id: String,
        #[arg(long)]
        endpoint: String,
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        region: Option<String>,
        /// Talk plain HTTP to the endpoint
        #[arg(long)]
        no_ssl: bool,
        #[arg(long, env = "STRATA_ACCESS_KEY")]
        access_key: String,
        #[arg(long, env = "STRATA_SECRET_KEY", hide_env_values = true)]
        secret_key: String,
    },
    List,
    Show { id: String },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        bucket: Option<String>,
        #[arg(long)]
        use_ssl: Option<bool>,
        #[arg(long)]
        access_key: Option<String>,
        #[arg(long)]
        secret_key: Option<String>,
    },
    Rm { id: String },
    /// Reconcile the catalog with the objects stored in the backend
    Scan { id: String },
}

#[derive(Subcommand, Debug)]
enum SyncCommand {
    /// Create a sync between a local directory and a virtual path
    Create {
        name: String,
        source: String,
        destination: String,
        /// upload-only, download-only or bidirectional
        #[arg(long, default_value = "bidirectional")]
        direction: String,
        #[arg(long)]
        workers: Option<u32>,
        #[arg(long)]
        chunk_size: Option<u64>,
        #[arg(long)]
        interval_secs: Option<u64>,
        /// Glob of local paths to skip; repeatable
        #[arg(long = "ignore")]
        ignore_patterns: Vec<String>,
    },
    List,
    Pause { name: String },
    Resume { name: String },
    Rm { name: String },
    /// Ask the agent to run a sync now
    Run { name: String },
    Status,
    /// Conflicts recorded for one sync, or for all of them
    Conflicts { name: Option<String> },
}

struct Printer {
    json: bool,
}

impl Printer {
    fn show<T: Serialize>(&self, value: &T, lines: impl FnOnce(&T) -> Vec<String>) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            for line in lines(value) {
                println!("{line}");
            }
        }
        Ok(())
    }

    fn done(&self, message: impl Into<String>) {
        if !self.json {
            println!("{}", message.into());
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let printer = Printer { json: cli.json };
    let client = AgentClient::connect()?;
    match cli.command {
        Command::Vfs(command) => run_vfs(&client, &printer, command),
        Command::Tag(command) => run_tag(&client, &printer, command).map(|_| ExitCode::SUCCESS),
        Command::Filter(command) => {
            run_filter(&client, &printer, command).map(|_| ExitCode::SUCCESS)
        }
        Command::Backend(command) => {
            run_backend(&client, &printer, command).map(|_| ExitCode::SUCCESS)
        }
        Command::Sync(command) => run_sync(&client, &printer, command).map(|_| ExitCode::SUCCESS),
    }
}

fn run_vfs(client: &AgentClient, printer: &Printer, command: VfsCommand) -> Result<ExitCode> {
    match command {
        VfsCommand::Ls { path } => printer.show(&client.list(&path)?, |e| render::entry_lines(e))?,
        VfsCommand::Test { path } => {
            let exists = client.exists(&path)?;
            if printer.json {
                println!("{exists}");
            }
            if !exists {
                return Ok(ExitCode::from(3));
            }
        }
        VfsCommand::Touch { path } => {
            printer.show(&client.touch(&path)?, |f| render::file_lines(std::slice::from_ref(f)))?
        }
        VfsCommand::Rm {
            path,
            recursive,
            yes,
        } => {
            let removed = client.remove(&path, recursive, yes)?;
            printer.show(&removed, |n| vec![format!("removed {n} entries")])?;
        }
        VfsCommand::Mkdir { path } => {
            printer.show(&client.mkdir(&path)?, |f| render::file_lines(std::slice::from_ref(f)))?
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_tag(client: &AgentClient, printer: &Printer, command: TagCommand) -> Result<()> {
    match command {
        TagCommand::Add { path, key, value } => {
            let added = client.tag_add(&path, &key, &value)?;
            printer.show(&added, |added| {
                vec![if *added {
                    format!("tagged {path} with {key}={value}")
                } else {
                    format!("{path} already has {key}={value}")
                }]
            })?;
        }
        TagCommand::List { path } => {
            printer.show(&client.tag_list(&path)?, |t| render::tag_lines(t))?
        }
        TagCommand::Rm { path, key, value } => {
            let removed = client.tag_remove(&path, &key, value.as_deref().unwrap_or(""))?;
            printer.show(&removed, |n| vec![format!("removed {n} tags")])?;
        }
        TagCommand::Search { key, value } => printer.show(
            &client.tag_search(&key, value.as_deref().unwrap_or(""))?,
            |f| render::file_lines(f),
        )?,
        TagCommand::Auto { path } => printer.show(&client.auto_tag(&path)?, |report| {
            vec![format!(
                "tagged {} files, {} new tags",
                report.files, report.added
            )]
        })?,
    }
    Ok(())
}

fn run_filter(client: &AgentClient, printer: &Printer, command: FilterCommand) -> Result<()> {
    match command {
        FilterCommand::Create {
            path,
            query,
            fields,
        } => {
            let request = FilterRequest {
                virtual_path: path,
                name: fields.name,
                query,
                description: fields.description,
            };
            printer.show(&client.create_filter(&request)?, |f| {
                render::filter_lines(std::slice::from_ref(f))
            })?;
        }
        FilterCommand::List => printer.show(&client.list_filters()?, |f| render::filter_lines(f))?,
        FilterCommand::Show { path } => printer.show(&client.show_filter(&path)?, |f| {
            render::filter_lines(std::slice::from_ref(f))
        })?,
        FilterCommand::Update {
            path,
            query,
            move_to,
            fields,
        } => {
            let request = FilterRequest {
                virtual_path: move_to.unwrap_or_else(|| path.clone()),
                name: fields.name,
                query,
                description: fields.description,
            };
            printer.show(&client.update_filter(&path, &request)?, |f| {
                render::filter_lines(std::slice::from_ref(f))
            })?;
        }
        FilterCommand::Delete { path } => {
            client.delete_filter(&path)?;
            printer.done(format!("deleted filter {path}"));
        }
        FilterCommand::Test { query } => {
            printer.show(&client.test_filter(&query)?, |f| render::file_lines(f))?
        }
    }
    Ok(())
}

fn run_backend(client: &AgentClient, printer: &Printer, command: BackendCommand) -> Result<()> {
    match command {
        BackendCommand::Provision {
            id,
            endpoint,
            bucket,
            name,
            region,
            no_ssl,
            access_key,
            secret_key,
        } => {
            let request = NewBackendRequest {
                name: name.unwrap_or_else(|| id.clone()),
                id,
                endpoint,
                region,
                bucket,
                use_ssl: !no_ssl,
                access_key,
                secret_key,
            };
            printer.show(&client.provision_backend(&request)?, |b| {
                render::backend_lines(std::slice::from_ref(b))
            })?;
        }
        BackendCommand::List => {
            printer.show(&client.list_backends()?, |b| render::backend_lines(b))?
        }
        BackendCommand::Show { id } => printer.show(&client.show_backend(&id)?, |b| {
            render::backend_lines(std::slice::from_ref(b))
        })?,
        BackendCommand::Update {
            id,
            name,
            endpoint,
            region,
            bucket,
            use_ssl,
            access_key,
            secret_key,
        } => {
            let request = BackendUpdateRequest {
                name,
                endpoint,
                region,
                bucket,
                use_ssl,
                access_key,
                secret_key,
            };
            printer.show(&client.update_backend(&id, &request)?, |b| {
                render::backend_lines(std::slice::from_ref(b))
            })?;
        }
        BackendCommand::Rm { id } => {
            client.remove_backend(&id)?;
            printer.done(format!("removed backend {id}"));
        }
        BackendCommand::Scan { id } => printer.show(&client.scan_backend(&id)?, |report| {
            vec![format!(
                "{}: scanned={} created={} updated={} removed={}",
                report.backend_id, report.scanned, report.created, report.updated, report.removed
            )]
        })?,
    }
    Ok(())
}

fn run_sync(client: &AgentClient, printer: &Printer, command: SyncCommand) -> Result<()> {
    match command {
        SyncCommand::Create {
            name,
            source,
            destination,
            direction,
            workers,
            chunk_size,
            interval_secs,
            ignore_patterns,
        } => {
            let request = SyncConfigRequest {
                name,
                source,
                destination,
                direction,
                workers,
                chunk_size,
                interval_secs,
                ignore_patterns,
            };
            printer.show(&client.create_sync(&request)?, |c| {
                render::sync_lines(std::slice::from_ref(c))
            })?;
        }
        SyncCommand::List => printer.show(&client.list_syncs()?, |c| render::sync_lines(c))?,
        SyncCommand::Pause { name } => {
            client.pause_sync(&name)?;
            printer.done(format!("paused {name}"));
        }
        SyncCommand::Resume { name } => {
            client.resume_sync(&name)?;
            printer.done(format!("resumed {name}"));
        }
        SyncCommand::Rm { name } => {
            client.remove_sync(&name)?;
            printer.done(format!("removed {name}"));
        }
        SyncCommand::Run { name } => {
            client.run_sync(&name)?;
            printer.done(format!("run of {name} requested"));
        }
        SyncCommand::Status => printer.show(&client.status()?, render::status_lines)?,
        SyncCommand::Conflicts { name } => printer.show(
            &client.list_conflicts(name.as_deref().unwrap_or(""))?,
            |c| render::conflict_lines(c),
        )?,
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            let failure = failure::classify(&err);
            eprintln!("strata: {}", failure.message);
            ExitCode::from(failure.exit_code() as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("strata").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ls_defaults_to_the_root() {
        match parse(&["vfs", "ls"]).command {
            Command::Vfs(VfsCommand::Ls { path }) => assert_eq!(path, ""),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rm_needs_explicit_flags() {
        match parse(&["vfs", "rm", "selfhosted"]).command {
            Command::Vfs(VfsCommand::Rm { recursive, yes, .. }) => {
                assert!(!recursive);
                assert!(!yes);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        match parse(&["vfs", "rm", "-r", "--yes", "selfhosted"]).command {
            Command::Vfs(VfsCommand::Rm { recursive, yes, .. }) => assert!(recursive && yes),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn sync_create_collects_ignore_patterns() {
        let cli = parse(&[
            "--json",
            "sync",
            "create",
            "docs",
            "/home/me/docs",
            "selfhosted/docs",
            "--direction",
            "upload-only",
            "--ignore",
            "*.tmp",
            "--ignore",
            ".git/**",
        ]);
        assert!(cli.json);
        match cli.command {
            Command::Sync(SyncCommand::Create {
                direction,
                ignore_patterns,
                ..
            }) => {
                assert_eq!(direction, "upload-only");
                assert_eq!(ignore_patterns, vec!["*.tmp", ".git/**"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn tag_rm_value_is_optional() {
        match parse(&["tag", "rm", "selfhosted/pic.jpg", "colour"]).command {
            Command::Tag(TagCommand::Rm { value, .. }) => assert!(value.is_none()),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_verbs_are_rejected() {
        assert!(Cli::try_parse_from(["strata", "vfs", "explode"]).is_err());
    }
}
