//! The command line front-end.
//!
//! Grammar: `caldo [filter] <command> [args...]`, where the optional
//! leading filter token selects target tasks by stable index (`3` or
//! `1,4,7`), tag (`+home`) or project (`project:chores`). A global
//! `--env NAME` switches to another environment anywhere on the line.

use std::error::Error;
use std::io::{BufRead, Write};

use chrono::Utc;

use crate::cache::Cache;
use crate::client::CalDavRemote;
use crate::config;
use crate::provider::Provider;
use crate::task::{
    Attachment, FieldPatch, Task, TaskFilter, TaskPatch, STATUS_IN_PROCESS, STATUS_NEEDS_ACTION,
};
use crate::undo;
use crate::update;

const USAGE: &str = "\
usage: caldo [filter] <command> [args...] [--env NAME]

commands:
  add <description and tokens>   create a task
  modify <tokens>                edit the selected tasks
  do                             complete the selected tasks
  start / stop                   set or unset in-process status
  del                            delete the selected tasks
  list                           show ready tasks (the default)
  waiting                        show tasks hidden behind a wait date
  show                           show every detail of the selected tasks
  attach <uri> [mime-type]       attach a link to the selected tasks
  move <env>                     move the selected tasks to another env
  prioritize                     interactively triage unprioritized tasks
  pull / push / sync             reconcile with the CalDAV server
  undo                           roll back the last operation
  log [n]                        show the transaction log
  config init [--force]          write a starter config file
  envs                           list known environments

filters: a stable index list (3 or 1,4,7), +tag, or project:name
tokens:  words, +tag, -tag, project:, due:, wait:, pri:, status:, x:KEY:VALUE";

/// Run the CLI; returns the process exit code
pub async fn run(args: Vec<String>) -> i32 {
    match run_inner(args).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    }
}

async fn run_inner(args: Vec<String>) -> Result<(), Box<dyn Error>> {
    let (args, env_flag) = extract_env_flag(args)?;
    let env_flag = env_flag.as_deref();

    let (filter, command, rest) = split_command_line(&args)?;

    // Commands that must work without a reachable (or configured) server
    match command.as_str() {
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            return Ok(());
        }
        "config" => return cmd_config(&rest, env_flag),
        "envs" => {
            for env in config::list_envs() {
                println!("{}", env);
            }
            return Ok(());
        }
        "complete" => return cmd_complete(&rest, env_flag),
        _ => {}
    }

    let config = config::load_config(env_flag)?;
    let cache = Cache::open(None, &config.env)?;
    let remote = CalDavRemote::new(&config)?;
    let provider = Provider::new(remote, cache);

    match command.as_str() {
        "add" => cmd_add(&provider, &rest),
        "modify" | "mod" => cmd_modify(&provider, &filter, &rest),
        "do" | "done" => cmd_do(&provider, &filter),
        "start" => cmd_set_status(&provider, &filter, STATUS_IN_PROCESS, "start"),
        "stop" => cmd_set_status(&provider, &filter, STATUS_NEEDS_ACTION, "stop"),
        "del" | "rm" => cmd_delete(&provider, &filter),
        "list" | "ls" => cmd_list(&provider, &filter, &config),
        "waiting" => cmd_waiting(&provider, &filter),
        "show" => cmd_show(&provider, &filter),
        "attach" => cmd_attach(&provider, &filter, &rest),
        "move" => cmd_move(&provider, &filter, &rest),
        "prioritize" => cmd_prioritize(&provider, &filter),
        "pull" => cmd_pull(&provider).await,
        "push" => cmd_push(&provider).await,
        "sync" => cmd_sync(&provider).await,
        "undo" => cmd_undo(provider.cache()),
        "log" => cmd_log(provider.cache(), &rest),
        other => Err(format!("unknown command {:?} (try 'caldo help')", other).into()),
    }
}

/// Pull `--env NAME` out of the argument list, wherever it is
fn extract_env_flag(args: Vec<String>) -> Result<(Vec<String>, Option<String>), Box<dyn Error>> {
    let mut out = Vec::with_capacity(args.len());
    let mut env = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--env" {
            env = Some(
                iter.next()
                    .ok_or("--env requires an environment name")?,
            );
        } else if let Some(value) = arg.strip_prefix("--env=") {
            env = Some(value.to_string());
        } else {
            out.push(arg);
        }
    }
    Ok((out, env))
}

fn split_command_line(
    args: &[String],
) -> Result<(TaskFilter, String, Vec<String>), Box<dyn Error>> {
    let mut args = args.iter();
    let first = match args.next() {
        None => return Ok((TaskFilter::default(), "list".to_string(), Vec::new())),
        Some(first) => first,
    };
    if let Some(filter) = parse_filter_token(first) {
        let command = args
            .next()
            .cloned()
            .unwrap_or_else(|| "list".to_string());
        return Ok((filter, command, args.cloned().collect()));
    }
    Ok((TaskFilter::default(), first.clone(), args.cloned().collect()))
}

fn parse_filter_token(token: &str) -> Option<TaskFilter> {
    if let Some(tag) = token.strip_prefix('+') {
        if tag.is_empty() {
            return None;
        }
        return Some(TaskFilter {
            tags: vec![tag.to_string()],
            ..TaskFilter::default()
        });
    }
    if let Some(project) = token.strip_prefix("project:") {
        if project.is_empty() {
            return None;
        }
        return Some(TaskFilter {
            project: Some(project.to_string()),
            ..TaskFilter::default()
        });
    }
    let indices: Result<Vec<i64>, _> = token.split(',').map(|part| part.parse()).collect();
    match indices {
        Ok(indices) if !indices.is_empty() => Some(TaskFilter::by_indices(indices)),
        _ => None,
    }
}

/// Resolve a filter to the tasks a mutating command operates on
fn selected_tasks<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
    filter: &TaskFilter,
) -> Result<Vec<Task>, Box<dyn Error>> {
    if filter.is_empty() {
        return Err("this command needs a filter (an index list, +tag or project:name)".into());
    }
    let tasks = provider.cache().list_tasks(Some(filter))?;
    if tasks.is_empty() {
        return Err("no tasks match the filter".into());
    }
    Ok(tasks)
}

/* Local commands */

fn cmd_add<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
    rest: &[String],
) -> Result<(), Box<dyn Error>> {
    let descriptor = update::parse_update(rest)?;
    if descriptor.summary.is_unchanged() {
        return Err("no description provided".into());
    }
    let patch = descriptor.resolve(Utc::now())?;
    let data = patch.apply(&crate::task::TaskData::default());
    let task = provider.add(data)?;
    println!(
        "Created [{}] {}",
        task.task_index.unwrap_or_default(),
        task.summary()
    );
    Ok(())
}

fn cmd_modify<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
    filter: &TaskFilter,
    rest: &[String],
) -> Result<(), Box<dyn Error>> {
    let tasks = selected_tasks(provider, filter)?;
    let descriptor = update::parse_update(rest)?;
    if descriptor.is_empty() {
        return Err("no changes provided".into());
    }
    let patch = descriptor.resolve(Utc::now())?;
    let diff = provider.modify(&tasks, &patch, "modify")?;
    print!("{}", index_keyed(&diff, &tasks).pretty());
    Ok(())
}

fn cmd_do<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
    filter: &TaskFilter,
) -> Result<(), Box<dyn Error>> {
    let tasks = selected_tasks(provider, filter)?;
    provider.complete(&tasks)?;
    for task in &tasks {
        println!(
            "Completed [{}] {}",
            task.task_index.unwrap_or_default(),
            task.summary()
        );
    }
    Ok(())
}

fn cmd_set_status<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
    filter: &TaskFilter,
    status: &str,
    operation: &str,
) -> Result<(), Box<dyn Error>> {
    let tasks = selected_tasks(provider, filter)?;
    let patch = TaskPatch::with_status(status);
    let diff = provider.modify(&tasks, &patch, operation)?;
    print!("{}", index_keyed(&diff, &tasks).pretty());
    Ok(())
}

fn cmd_delete<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
    filter: &TaskFilter,
) -> Result<(), Box<dyn Error>> {
    let tasks = selected_tasks(provider, filter)?;
    provider.delete(&tasks)?;
    for task in &tasks {
        println!(
            "Deleted [{}] {}",
            task.task_index.unwrap_or_default(),
            task.summary()
        );
    }
    Ok(())
}

fn cmd_list<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
    filter: &TaskFilter,
    config: &config::CaldavConfig,
) -> Result<(), Box<dyn Error>> {
    let filter = if filter.is_empty() { None } else { Some(filter) };
    let tasks = provider.cache().list_ready_tasks(filter)?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    print_task_table(&tasks, config.show_uids, "Due");
    Ok(())
}

fn cmd_waiting<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
    filter: &TaskFilter,
) -> Result<(), Box<dyn Error>> {
    let filter = if filter.is_empty() { None } else { Some(filter) };
    let tasks = provider.cache().list_waiting_tasks(filter)?;
    if tasks.is_empty() {
        println!("No waiting tasks.");
        return Ok(());
    }
    print_task_table(&tasks, false, "Wait");
    Ok(())
}

fn cmd_show<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
    filter: &TaskFilter,
) -> Result<(), Box<dyn Error>> {
    let tasks = selected_tasks(provider, filter)?;
    for task in &tasks {
        println!("[{}] {}", task.task_index.unwrap_or_default(), task.summary());
        println!("  uid:      {}", task.uid);
        if let Some(status) = &task.data.status {
            println!("  status:   {}", status);
        }
        if let Some(priority) = task.data.priority {
            println!("  priority: {}", priority);
        }
        if let Some(due) = &task.data.due {
            println!("  due:      {}", due.format("%Y-%m-%d %H:%M"));
        }
        if let Some(wait) = &task.data.wait {
            println!("  wait:     {}", wait.format("%Y-%m-%d %H:%M"));
        }
        if let Some(project) = task.data.project() {
            println!("  project:  {}", project);
        }
        if let Some(categories) = &task.data.categories {
            if !categories.is_empty() {
                println!("  tags:     {}", categories.join(", "));
            }
        }
        if let Some(url) = &task.data.url {
            println!("  url:      {}", url);
        }
        for attachment in &task.data.attachments {
            match &attachment.fmttype {
                Some(fmttype) => println!("  attach:   {} ({})", attachment.uri, fmttype),
                None => println!("  attach:   {}", attachment.uri),
            }
        }
        for (key, value) in &task.data.x_properties {
            if key != crate::task::X_PROJECT {
                println!("  {}: {}", key.to_lowercase(), value);
            }
        }
        if let Some(href) = &task.href {
            println!("  href:     {}", href);
        }
    }
    Ok(())
}

fn cmd_attach<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
    filter: &TaskFilter,
    rest: &[String],
) -> Result<(), Box<dyn Error>> {
    let tasks = selected_tasks(provider, filter)?;
    let uri = rest.first().ok_or("attach needs a URI")?;
    let fmttype = rest.get(1).cloned();
    let attachment = Attachment::new(uri, fmttype);
    let diff = provider.attach(&tasks, &attachment)?;
    print!("{}", index_keyed(&diff, &tasks).pretty());
    Ok(())
}

fn cmd_move<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
    filter: &TaskFilter,
    rest: &[String],
) -> Result<(), Box<dyn Error>> {
    let tasks = selected_tasks(provider, filter)?;
    let dest_env = rest.first().ok_or("move needs a destination environment")?;
    let dest_env = crate::cache::normalize_env(dest_env);
    let destination = Cache::open(None, &dest_env)?;
    provider.move_to(&tasks, &destination)?;
    for task in &tasks {
        println!("Moved {} to {}", task.summary(), dest_env);
    }
    Ok(())
}

fn cmd_prioritize<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
    filter: &TaskFilter,
) -> Result<(), Box<dyn Error>> {
    let filter = if filter.is_empty() { None } else { Some(filter) };
    let tasks = provider.cache().list_unprioritized_tasks(filter)?;
    if tasks.is_empty() {
        println!("Nothing to prioritize.");
        return Ok(());
    }
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    for task in &tasks {
        print!(
            "[{}] {} -- priority (h/m/l/1-9, empty to skip, q to quit): ",
            task.task_index.unwrap_or_default(),
            task.summary()
        );
        std::io::stdout().flush()?;
        let answer = match lines.next() {
            None => break,
            Some(line) => line?,
        };
        let answer = answer.trim();
        if answer.is_empty() {
            continue;
        }
        if answer == "q" {
            break;
        }
        let priority = match answer {
            "h" => 1,
            "m" => 5,
            "l" => 9,
            digit => match digit.parse::<u8>() {
                Ok(p) if (1..=9).contains(&p) => p,
                _ => {
                    println!("  (skipping, {:?} is not a priority)", answer);
                    continue;
                }
            },
        };
        let patch = TaskPatch {
            priority: FieldPatch::Set(priority),
            ..TaskPatch::default()
        };
        provider.modify(std::slice::from_ref(task), &patch, "modify")?;
    }
    Ok(())
}

/* Remote commands */

async fn cmd_pull<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
) -> Result<(), Box<dyn Error>> {
    let outcome = provider.pull().await?;
    println!("Fetched {} tasks.", outcome.fetched);
    print!("{}", outcome.diff.pretty());
    Ok(())
}

async fn cmd_push<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
) -> Result<(), Box<dyn Error>> {
    let outcome = provider.push().await?;
    print!("{}", outcome.diff.pretty());
    Ok(())
}

async fn cmd_sync<R: crate::traits::RemoteSource>(
    provider: &Provider<R>,
) -> Result<(), Box<dyn Error>> {
    let outcome = provider.sync().await?;
    println!("Fetched {} tasks.", outcome.pull.fetched);
    print!("{}", outcome.pull.diff.pretty());
    println!(
        "Pushed: {} created, {} updated, {} deleted.",
        outcome.push.diff.created_count(),
        outcome.push.diff.updated_count(),
        outcome.push.diff.deleted_count()
    );
    Ok(())
}

fn cmd_undo(cache: &Cache) -> Result<(), Box<dyn Error>> {
    match undo::undo(cache)? {
        None => println!("Nothing to undo."),
        Some(outcome) => {
            println!(
                "Rolled back {}:",
                outcome.operation.as_deref().unwrap_or("last operation")
            );
            print!("{}", outcome.diff.pretty());
        }
    }
    Ok(())
}

fn cmd_log(cache: &Cache, rest: &[String]) -> Result<(), Box<dyn Error>> {
    let limit = match rest.first() {
        None => None,
        Some(raw) => Some(
            raw.parse::<usize>()
                .map_err(|_| format!("invalid log limit {:?}", raw))?,
        ),
    };
    let entries = cache.transaction_log(limit)?;
    if entries.is_empty() {
        println!("Transaction log is empty.");
        return Ok(());
    }
    for entry in entries {
        let diff = entry.diff()?;
        println!(
            "#{} {} ({} created, {} updated, {} deleted)",
            entry.id,
            entry.operation.as_deref().unwrap_or("(untagged)"),
            diff.created_count(),
            diff.updated_count(),
            diff.deleted_count()
        );
    }
    Ok(())
}

/* Commands that do not need a server configuration */

fn cmd_config(rest: &[String], env_flag: Option<&str>) -> Result<(), Box<dyn Error>> {
    match rest.first().map(|s| s.as_str()) {
        Some("init") => {
            let force = rest.iter().any(|arg| arg == "--force");
            let env = config::resolve_env(env_flag);
            let path = config::init_config_file(&env, force)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        _ => Err("usage: caldo config init [--force]".into()),
    }
}

/// Shell completion helper. Never fails loudly: completion scripts want
/// either suggestions or silence.
fn cmd_complete(rest: &[String], env_flag: Option<&str>) -> Result<(), Box<dyn Error>> {
    let what = match rest.first() {
        None => return Ok(()),
        Some(what) => what.as_str(),
    };
    if what == "envs" {
        for env in config::list_envs() {
            println!("{}", env);
        }
        return Ok(());
    }
    let env = config::resolve_env(env_flag);
    let cache = match Cache::open(None, &env) {
        Ok(cache) => cache,
        Err(_) => return Ok(()),
    };
    match what {
        "tasks" => {
            if let Ok(tasks) = cache.list_tasks(None) {
                for task in tasks {
                    println!("{}\t{}", task.task_index.unwrap_or_default(), task.summary());
                }
            }
        }
        "tags" => {
            if let Ok(tags) = cache.list_tags() {
                for tag in tags {
                    println!("+{}", tag);
                }
            }
        }
        "projects" => {
            if let Ok(projects) = cache.list_projects() {
                for project in projects {
                    println!("project:{}", project);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/* Rendering */

fn print_task_table(tasks: &[Task], show_uids: bool, date_label: &str) {
    let id_width = tasks
        .iter()
        .map(|t| t.task_index.unwrap_or_default().to_string().len())
        .max()
        .unwrap_or(2)
        .max(2);
    println!(
        "{:>id$}  P  {:<10}  {:<12}  Description",
        "ID",
        date_label,
        "Project",
        id = id_width
    );
    for task in tasks {
        let date = match date_label {
            "Wait" => task.data.wait,
            _ => task.data.due,
        };
        let date = date
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let priority = task
            .data
            .priority
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let project = task.data.project().unwrap_or("");
        let tags = task
            .data
            .categories
            .as_ref()
            .filter(|c| !c.is_empty())
            .map(|c| format!(" [{}]", c.join(",")))
            .unwrap_or_default();
        let uid = if show_uids {
            format!("  ({})", task.uid)
        } else {
            String::new()
        };
        println!(
            "{:>id$}  {}  {:<10}  {:<12}  {}{}{}",
            task.task_index.unwrap_or_default(),
            priority,
            date,
            project,
            task.summary(),
            tags,
            uid,
            id = id_width
        );
    }
}

/// Re-key a uid-keyed diff by stable index for display
fn index_keyed(
    diff: &crate::diff::TaskSetDiff<String>,
    tasks: &[Task],
) -> crate::diff::TaskSetDiff<i64> {
    let indices: std::collections::HashMap<&str, i64> = tasks
        .iter()
        .filter_map(|t| t.task_index.map(|i| (t.uid.as_str(), i)))
        .collect();
    diff.map_keys(|uid| indices.get(uid.as_str()).copied().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_tokens() {
        assert_eq!(
            parse_filter_token("3"),
            Some(TaskFilter::by_indices(vec![3]))
        );
        assert_eq!(
            parse_filter_token("1,4,7"),
            Some(TaskFilter::by_indices(vec![1, 4, 7]))
        );
        assert_eq!(
            parse_filter_token("+home"),
            Some(TaskFilter {
                tags: vec!["home".to_string()],
                ..TaskFilter::default()
            })
        );
        assert_eq!(
            parse_filter_token("project:chores"),
            Some(TaskFilter {
                project: Some("chores".to_string()),
                ..TaskFilter::default()
            })
        );
        assert_eq!(parse_filter_token("add"), None);
        assert_eq!(parse_filter_token("1,x"), None);
    }

    #[test]
    fn command_line_splitting() {
        let args: Vec<String> = vec!["3".into(), "do".into()];
        let (filter, command, rest) = split_command_line(&args).unwrap();
        assert_eq!(filter, TaskFilter::by_indices(vec![3]));
        assert_eq!(command, "do");
        assert!(rest.is_empty());

        let args: Vec<String> = vec!["add".into(), "Buy".into(), "milk".into()];
        let (filter, command, rest) = split_command_line(&args).unwrap();
        assert!(filter.is_empty());
        assert_eq!(command, "add");
        assert_eq!(rest, vec!["Buy".to_string(), "milk".to_string()]);

        // A bare filter lists the matching tasks
        let args: Vec<String> = vec!["+home".into()];
        let (filter, command, _) = split_command_line(&args).unwrap();
        assert_eq!(filter.tags, vec!["home".to_string()]);
        assert_eq!(command, "list");

        let (_, command, _) = split_command_line(&[]).unwrap();
        assert_eq!(command, "list");
    }

    #[test]
    fn env_flag_extraction() {
        let (args, env) = extract_env_flag(vec![
            "list".to_string(),
            "--env".to_string(),
            "work".to_string(),
        ])
        .unwrap();
        assert_eq!(args, vec!["list".to_string()]);
        assert_eq!(env.as_deref(), Some("work"));

        let (args, env) =
            extract_env_flag(vec!["--env=home".to_string(), "sync".to_string()]).unwrap();
        assert_eq!(args, vec!["sync".to_string()]);
        assert_eq!(env.as_deref(), Some("home"));

        assert!(extract_env_flag(vec!["--env".to_string()]).is_err());
    }
}
