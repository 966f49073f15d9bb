use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
  BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
  ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::acker::Acker;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::Mutex;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{error, info};
use uuid::Uuid;

use super::{Acknowledge, Dispatch, DispatchMessage, DispatchQueue, QueueConsumer};
use crate::error::QueueError;

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;
const PERSISTENT: u8 = 2;

async fn open_channel(conn: &Connection) -> Result<Channel, QueueError> {
  let channel = conn.create_channel().await?;
  channel.confirm_select(ConfirmSelectOptions::default()).await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

pub async fn publish_message(
  channel: &Channel,
  queue: &str,
  payload: &[u8],
  properties: BasicProperties,
) -> Result<(), QueueError> {
  let confirmation = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    let properties = properties.clone();
    async move {
      channel
        .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
        .await?
        .await
    }
  })
    .await?;
  if confirmation.is_nack() {
    return Err(QueueError::Rejected(queue.to_string()));
  }
  Ok(())
}

fn delay_millis(delay: Duration) -> i64 {
  i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

/// One delay queue per delay value. RabbitMQ only expires messages at the head
/// of a queue, so mixing delays in one queue would hold short ones behind long ones.
fn delay_queue_name(queue: &str, delay: Duration) -> String {
  format!("{queue}.delay.{}", delay_millis(delay))
}

fn delay_queue_args(queue: &str, delay: Duration) -> FieldTable {
  let ttl = delay_millis(delay);
  let mut args = FieldTable::default();
  args.insert(ShortString::from("x-message-ttl"), AMQPValue::LongLongInt(ttl));
  args.insert(ShortString::from("x-dead-letter-exchange"), AMQPValue::LongString("".into()));
  args.insert(ShortString::from("x-dead-letter-routing-key"), AMQPValue::LongString(queue.into()));
  args
}

/// RabbitMQ-backed dispatch queue. A message delayed by `d` sits in
/// `<queue>.delay.<d ms>`, whose queue TTL dead-letters it back into `<queue>`.
pub struct AmqpDispatchQueue {
  connection: Connection,
  channel: Channel,
  declared: Mutex<HashSet<String>>,
  prefetch: u16,
}

impl AmqpDispatchQueue {
  pub async fn connect(rabbitmq_url: &str, prefetch: u16) -> Result<Self, QueueError> {
    let connection = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
      Connection::connect(rabbitmq_url, ConnectionProperties::default())
    })
      .await?;
    let channel = open_channel(&connection).await?;
    Ok(Self {
      connection,
      channel,
      declared: Mutex::new(HashSet::new()),
      prefetch,
    })
  }

  /// Ready messages in `queue`, without declaring it. The passive declare runs on
  /// a throwaway channel, since the broker closes the channel when the queue is missing.
  pub async fn message_count(&self, queue: &str) -> Result<u32, QueueError> {
    let side = self.connection.create_channel().await?;
    let declared = side
      .queue_declare(queue, QueueDeclareOptions { passive: true, ..Default::default() }, FieldTable::default())
      .await;
    if side.status().connected() {
      let _ = side.close(200, "OK").await;
    }
    Ok(declared?.message_count())
  }

  async fn declare(&self, queue: &str, args: FieldTable) -> Result<(), QueueError> {
    let mut declared = self.declared.lock().await;
    if declared.contains(queue) {
      return Ok(());
    }
    let durable = QueueDeclareOptions { durable: true, ..Default::default() };
    self.channel.queue_declare(queue, durable, args).await?;
    declared.insert(queue.to_string());
    Ok(())
  }

  async fn publish(&self, routing_key: &str, message: &DispatchMessage) -> Result<(), QueueError> {
    let payload = serde_json::to_vec(message)?;
    let properties = BasicProperties::default()
      .with_delivery_mode(PERSISTENT)
      .with_content_type(ShortString::from("application/json"))
      .with_message_id(ShortString::from(message.reference.as_str()));
    publish_message(&self.channel, routing_key, &payload, properties).await
  }
}

#[async_trait]
impl DispatchQueue for AmqpDispatchQueue {
  async fn enqueue(&self, queue: &str, task_id: Uuid) -> Result<String, QueueError> {
    self.declare(queue, FieldTable::default()).await?;
    let message = DispatchMessage::new(queue, task_id);
    self.publish(queue, &message).await?;
    Ok(message.reference)
  }

  async fn enqueue_delayed(&self, queue: &str, task_id: Uuid, delay: Duration) -> Result<String, QueueError> {
    self.declare(queue, FieldTable::default()).await?;
    let delay_queue = delay_queue_name(queue, delay);
    self.declare(&delay_queue, delay_queue_args(queue, delay)).await?;
    let message = DispatchMessage::new(queue, task_id);
    self.publish(&delay_queue, &message).await?;
    Ok(message.reference)
  }

  async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn QueueConsumer>, QueueError> {
    self.declare(queue, FieldTable::default()).await?;
    self.channel.basic_qos(self.prefetch, BasicQosOptions::default()).await?;
    let consumer = self
      .channel
      .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
      .await?;
    Ok(Box::new(AmqpConsumer { consumer }))
  }
}

struct AmqpConsumer {
  consumer: Consumer,
}

#[async_trait]
impl QueueConsumer for AmqpConsumer {
  async fn next(&mut self) -> Option<Result<Dispatch, QueueError>> {
    while let Some(delivery) = self.consumer.next().await {
      let delivery = match delivery {
        Ok(delivery) => delivery,
        Err(e) => return Some(Err(e.into())),
      };
      match serde_json::from_slice::<DispatchMessage>(&delivery.data) {
        Ok(message) => return Some(Ok(Dispatch::new(message, Box::new(AmqpAcker { acker: delivery.acker })))),
        Err(e) => {
          error!("Failed to parse dispatch message: {:?}", e);
          let _ = delivery.acker.ack(BasicAckOptions::default()).await;
        }
      }
    }
    None
  }
}

struct AmqpAcker {
  acker: Acker,
}

#[async_trait]
impl Acknowledge for AmqpAcker {
  async fn ack(&self) -> Result<(), QueueError> {
    self.acker.ack(BasicAckOptions::default()).await?;
    Ok(())
  }

  async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
    self.acker.nack(BasicNackOptions { requeue, ..Default::default() }).await?;
    Ok(())
  }
}
