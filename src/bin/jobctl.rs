//! Ad hoc CLI for inspecting and poking at queues without a full
//! [`autoweave_core::manager::QueueManager`] instance. Connects straight to
//! Redis via the same key layout [`autoweave_core::queue::Queue`] uses, so
//! it can be run against a live deployment without its own registry.

use autoweave_core::config::WorkerPoolSettings;
use autoweave_core::events::EventBus;
use autoweave_core::job::{JobOptions, JobPayload, JobSubmission, SystemMaintenancePayload};
use autoweave_core::queue::Queue;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "jobctl", about = "inspect and manipulate autoweave job queues")]
struct Args {
    /// Queue name to operate on.
    queue: String,
    #[structopt(subcommand)]
    cmd: QueueCmd,
}

#[derive(Debug, StructOpt)]
enum QueueCmd {
    /// Prints queue-wide counters (waiting/delayed/active/completed/...).
    Status,
    /// Submits a system-maintenance job with the given task name.
    Add { task: String },
    /// Prints one job's full record as JSON.
    Show { id: String },
    /// Cancels a pending (not yet claimed) job.
    Cancel { id: String },
    /// Resets a failed job back to waiting.
    Retry { id: String },
    /// Pauses claiming on the queue.
    Pause,
    /// Resumes claiming on the queue.
    Resume,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    autoweave_core::logging::init_tracing();
    let args = Args::from_args();

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let pool = autoweave_database::RedisPool::from_url(redis_url, None)?;
    let queue = Queue::new(pool, args.queue.clone(), WorkerPoolSettings::default(), EventBus::new());

    match args.cmd {
        QueueCmd::Status => {
            let status = queue.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        QueueCmd::Add { task } => {
            let submission = JobSubmission::with_options(
                JobPayload::SystemMaintenance(SystemMaintenancePayload { task, options: serde_json::Value::Null }),
                JobOptions::default(),
            );
            let id = queue.enqueue(submission).await?;
            println!("enqueued {id}");
        }
        QueueCmd::Show { id } => match queue.get_job(&id).await? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
            None => eprintln!("no such job: {id}"),
        },
        QueueCmd::Cancel { id } => {
            let status = queue.cancel_pending_job(&id).await?;
            println!("{id} -> {status:?}");
        }
        QueueCmd::Retry { id } => {
            queue.retry_job(&id).await?;
            println!("{id} reset to waiting");
        }
        QueueCmd::Pause => {
            queue.pause().await?;
            println!("{} paused", args.queue);
        }
        QueueCmd::Resume => {
            queue.resume().await?;
            println!("{} resumed", args.queue);
        }
    }

    Ok(())
}
