use stoker::{async_trait, Handler, Job, Queue, QueueOptions};

struct SendEmail;

#[async_trait]
impl Handler for SendEmail {
    async fn perform(&self, job: &mut Job) -> anyhow::Result<()> {
        let to = job.data()["to"].as_str().unwrap_or("<nobody>").to_string();
        job.log(format!("sending to {to}")).await?;
        job.progress(1, 2).await?;

        // Pretend to talk to an SMTP server.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        job.progress(2, 2).await?;
        println!("[worker] delivered email to {to}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let queue = Queue::connect(QueueOptions::default()).await?;

    let mut events = queue.job_events().await?;
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("[events] job {} -> {:?} {:?}", event.id, event.event, event.args);
        }
    });

    queue.process("email", 2, SendEmail).await?;
    queue.promote(stoker::promoter::DEFAULT_INTERVAL);
    println!("[worker] processing 'email' jobs; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    queue.shutdown().await;
    Ok(())
}
