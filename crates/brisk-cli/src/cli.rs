use brisk_core::tasks::Priority;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "brisk",
    about = "Local-first task list with background sync",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Optional subcommand; defaults to listing open tasks.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print version and exit.
    Version,
    /// Check that the encrypted store and the saved snapshot are readable.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Create, edit and complete tasks.
    #[command(subcommand)]
    Task(TaskCommand),
    /// Manage task lists.
    #[command(subcommand)]
    List(ListCommand),
    /// Inspect and repair the outgoing change queue.
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Push queued changes and pull remote updates.
    Sync {
        /// Keep syncing in the background until Ctrl-C.
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum TaskCommand {
    /// Show tasks in display order.
    List {
        /// Only tasks in this list (id or id prefix).
        #[arg(long)]
        list: Option<String>,
        /// Include completed tasks.
        #[arg(long)]
        all: bool,
    },
    Add(AddTask),
    /// Change a task's title, description or priority.
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<Priority>,
    },
    /// Toggle completion.
    Done { id: String },
    Delete { id: String },
    /// Set the due date (YYYY-MM-DD); omit the date to clear it.
    Due { id: String, date: Option<NaiveDate> },
    Duplicate { id: String },
    /// Move a task to another list.
    Move {
        id: String,
        list: String,
        /// Place it right after this task.
        #[arg(long)]
        after: Option<String>,
    },
    #[command(subcommand)]
    Subtask(SubtaskCommand),
}

/// Create a task.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct AddTask {
    pub title: String,
    #[arg(short, long)]
    pub description: Option<String>,
    #[arg(short, long)]
    pub priority: Option<Priority>,
    /// Due date, YYYY-MM-DD.
    #[arg(long)]
    pub due: Option<NaiveDate>,
    /// Target list (id or id prefix); defaults to the first list.
    #[arg(long)]
    pub list: Option<String>,
    /// Repeatable.
    #[arg(short, long = "label")]
    pub labels: Vec<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum SubtaskCommand {
    Add { task: String, title: String },
    /// Toggle a subtask's completion.
    Done { task: String, subtask: String },
    Remove { task: String, subtask: String },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ListCommand {
    List,
    Add {
        name: String,
        #[arg(long)]
        color: Option<String>,
    },
    Hide { id: String },
    Show { id: String },
    /// Delete a list; a non-empty list needs a list to move its tasks to.
    Delete {
        id: String,
        #[arg(long)]
        reassign: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum QueueCommand {
    List,
    /// Put failed changes back at the front of the queue (all when no id).
    Retry { id: Option<String> },
    /// Drop every failed change.
    ClearFailed,
}
