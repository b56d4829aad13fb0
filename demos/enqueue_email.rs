use serde_json::json;
use stoker::{Priority, Queue, QueueOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let queue = Queue::connect(QueueOptions::default()).await?;

    let mut job = queue.create(
        "email",
        json!({"to": "user@example.com", "subject": "Welcome!", "body": "Thanks for signing up"}),
    );
    let id = job.save().await?;
    println!("[enqueue] enqueued email job id={id}");

    let mut urgent = queue.create(
        "email",
        json!({"to": "user@example.com", "subject": "Urgent", "body": "Please read"}),
    );
    urgent
        .priority(Priority::CRITICAL)
        .attempts(5)
        .delay(60_000);
    let id = urgent.save().await?;
    println!("[enqueue] enqueued delayed critical email id={id} - done.");

    Ok(())
}
