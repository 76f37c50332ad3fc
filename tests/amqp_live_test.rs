// Needs a running RabbitMQ; configure it with the RABBITMQ_* variables.
// Run with `cargo test -- --ignored`.

use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;

use task_queue::rabbitmq::{TaskDispatcher, TaskError};
use task_queue::{BrokerConfig, ConnectionManager, TaskMessage};

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn task_round_trips_through_rabbitmq() {
    let config = BrokerConfig::from_env().expect("Invalid RABBITMQ_* configuration");
    let manager = ConnectionManager::amqp(config).unwrap();
    let queue = format!("task-queue-live-{}", uuid::Uuid::new_v4());

    manager.declare_queue(&queue).await.unwrap();
    manager
        .submit_task("sync_subscription", &json!({"code": "monthly_pro"}), &queue)
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    let dispatcher = TaskDispatcher::new(move |message: TaskMessage| {
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(message);
        }
        async { Ok::<(), TaskError>(()) }
    });

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let consume = manager.consume(&queue, &dispatcher, async {
        let _ = stop_rx.await;
    });
    let wait = async {
        let received = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("no task within 10s")
            .unwrap();
        let _ = stop_tx.send(());
        received
    };

    let (summary, received) = tokio::join!(consume, wait);
    assert_eq!(summary.unwrap().delivered, 1);
    assert_eq!(received, TaskMessage::new("sync_subscription", json!({"code": "monthly_pro"})));
}
