//! Thin RabbitMQ adapter over `amqprs`.
//!
//! One [`RabbitMQ`] connection hands out [`Publisher`]s (durable queue or fanout exchange)
//! and [`Subscription`]s (durable work queue with manual acknowledgement).

use amqprs::{
    Ack, BasicProperties, Cancel, Close, FieldTable, Nack, Return, ShortStr,
    callbacks::{ChannelCallback, ConnectionCallback},
    channel::{
        BasicAckArguments, BasicConsumeArguments, BasicNackArguments, BasicPublishArguments, Channel,
        ConsumerMessage, ExchangeDeclareArguments, QueueDeclareArguments,
    },
    connection::{Connection, OpenConnectionArguments},
};
use async_trait::async_trait;
use tokio::{
    select,
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Header carrying the request id of a published message.
pub const REQUEST_ID_HEADER: &str = "request_id";

/// Where a publisher delivers its messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublisherMode {
    /// Durable, client-named queue; every message goes to exactly one consumer.
    Queue,
    /// Durable fanout exchange; every bound queue receives a copy.
    Broadcast,
}

impl PublisherMode {
    /// Arguments used to publish under this mode to `name`.
    fn publish_arguments(self, name: &str) -> BasicPublishArguments {
        match self {
            Self::Queue => BasicPublishArguments::new("", name),
            Self::Broadcast => BasicPublishArguments::new(name, ""),
        }
    }
}

/// An open broker connection.
pub struct RabbitMQ {
    conn: Connection,
    app_id: String,
}

impl RabbitMQ {
    /// Opens a connection to `conn_str` (an `amqp://` URI).
    pub async fn connect(conn_str: &str, app_id: &str) -> Result<Self, RabbitMQError> {
        let conn = open_rabbit_connection(conn_str).await?;
        Ok(Self {
            conn,
            app_id: app_id.to_owned(),
        })
    }

    /// Declares `name` according to `mode` and returns a publisher for it.
    ///
    /// Messages are marked persistent so that durable queues keep them across broker restarts.
    pub async fn publisher(&self, name: &str, mode: PublisherMode) -> Result<Publisher, RabbitMQError> {
        let channel = open_rabbit_channel(&self.conn).await?;
        match mode {
            PublisherMode::Queue => {
                channel
                    .queue_declare(QueueDeclareArguments::durable_client_named(name))
                    .await
                    .map_err(|err| RabbitMQError::QueueDeclarationError(err.to_string()))?;
            }
            PublisherMode::Broadcast => {
                let args = ExchangeDeclareArguments::new(name, "fanout").durable(true).finish();
                channel
                    .exchange_declare(args)
                    .await
                    .map_err(|err| RabbitMQError::ExchangeDeclarationError(err.to_string()))?;
            }
        }

        let props = BasicProperties::default()
            .with_app_id(&self.app_id)
            .with_delivery_mode(2)
            .finish();
        info!("Publisher ready on {} ({:?})", name, mode);
        Ok(Publisher::new(name, mode, props, channel))
    }

    /// Declares the durable queue `queue` and starts consuming it with manual acks.
    pub async fn subscribe(&self, queue: &str) -> Result<Subscription, RabbitMQError> {
        let channel = open_rabbit_channel(&self.conn).await?;
        channel
            .queue_declare(QueueDeclareArguments::durable_client_named(queue))
            .await
            .map_err(|err| RabbitMQError::QueueDeclarationError(err.to_string()))?;

        let (_ctag, rx) = channel
            .basic_consume_rx(BasicConsumeArguments::new(queue, ""))
            .await
            .map_err(|err| RabbitMQError::SubscriptionError(err.to_string()))?;

        info!("Subscribed to queue {}", queue);
        Ok(Subscription {
            queue_name: queue.to_owned(),
            consumer: rx,
            channel,
        })
    }

    /// Closes the connection. Publishers and subscriptions should be closed first.
    pub async fn close(self) -> Result<(), RabbitMQError> {
        self.conn
            .close()
            .await
            .map_err(|err| RabbitMQError::ConnectionError(err.to_string()))
    }
}

/// Consumer side of a durable work queue.
///
/// Messages must be acknowledged with [`Subscription::ack`] or returned with
/// [`Subscription::reject`]; unacknowledged messages are redelivered by the broker.
pub struct Subscription {
    queue_name: String,
    consumer: UnboundedReceiver<ConsumerMessage>,
    channel: Channel,
}

impl Subscription {
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Receives the next message, or `None` once the channel is closed.
    pub async fn receive(&mut self) -> Option<ConsumerMessage> {
        self.consumer.recv().await
    }

    /// Acknowledges `message` as processed.
    pub async fn ack(&self, message: &ConsumerMessage) -> Result<(), RabbitMQError> {
        let deliver = message.deliver.as_ref().ok_or(RabbitMQError::NotDeliveryTag)?;
        self.channel
            .basic_ack(BasicAckArguments::new(deliver.delivery_tag(), false))
            .await
            .map_err(|err| RabbitMQError::AckMessageError(err.to_string()))
    }

    /// Negatively acknowledges `message`, asking the broker to redeliver it when `requeue` is set.
    pub async fn reject(&self, message: &ConsumerMessage, requeue: bool) -> Result<(), RabbitMQError> {
        let deliver = message.deliver.as_ref().ok_or(RabbitMQError::NotDeliveryTag)?;
        self.channel
            .basic_nack(BasicNackArguments::new(deliver.delivery_tag(), false, requeue))
            .await
            .map_err(|err| RabbitMQError::AckMessageError(err.to_string()))
    }

    /// Closes the subscription channel.
    pub async fn close(self) -> Result<(), RabbitMQError> {
        self.channel
            .close()
            .await
            .map_err(|err| RabbitMQError::CloseChannelError(err.to_string()))
    }
}

struct RabbitPublishMessage(Vec<u8>, BasicProperties);

/// Publisher bound to one queue or exchange.
///
/// [`Publisher::send`] publishes inline and reports broker errors to the caller.
/// [`Publisher::publish`] hands the message to a background task and returns immediately;
/// errors are only logged. Call [`Publisher::close`] to stop the task and close the channel.
pub struct Publisher {
    name: String,
    pub_args: BasicPublishArguments,
    msg_common_props: BasicProperties,
    channel: Channel,
    dispatcher: UnboundedSender<RabbitPublishMessage>,
    _handler: (JoinHandle<()>, CancellationToken),
}

impl Publisher {
    fn new(name: &str, mode: PublisherMode, msg_common_props: BasicProperties, channel: Channel) -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<RabbitPublishMessage>();
        let pub_args = mode.publish_arguments(name);

        let task_channel = channel.clone();
        let task_args = pub_args.clone();
        let target = name.to_owned();
        let cancel_token = CancellationToken::new();
        let cloned_token = cancel_token.clone();

        let handler = tokio::spawn(async move {
            loop {
                select! {
                    _ = cloned_token.cancelled() => {
                        debug!("publisher for {} was closed", target);
                        return;
                    },
                    message = rx.recv() => match message {
                        Some(RabbitPublishMessage(content, props)) => {
                            if let Err(err) = task_channel.basic_publish(props, content, task_args.clone()).await {
                                error!("error while publishing to {}: {}", target, err);
                            }
                        }
                        None => return,
                    }
                }
            }
        });

        Self {
            name: name.to_owned(),
            pub_args,
            msg_common_props,
            channel,
            dispatcher: tx,
            _handler: (handler, cancel_token),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes `message` and waits until it was written to the channel.
    pub async fn send(&self, message: Message, ctx: PublisherContext) -> Result<(), RabbitMQError> {
        let props = ctx.into_basic_props(&self.msg_common_props);
        self.channel
            .basic_publish(props, message.content, self.pub_args.clone())
            .await
            .map_err(|err| RabbitMQError::SendError(err.to_string()))
    }

    /// Queues `message` for the background task without waiting.
    ///
    /// # Errors
    /// `RabbitMQError::PublishError` if the background task is gone.
    pub fn publish(&self, message: Message, ctx: PublisherContext) -> Result<(), RabbitMQError> {
        let props = ctx.into_basic_props(&self.msg_common_props);
        self.dispatcher
            .send(RabbitPublishMessage(message.content, props))
            .map_err(|_| RabbitMQError::PublishError)
    }

    /// Stops the background task and closes the channel.
    pub async fn close(self) -> Result<(), RabbitMQError> {
        self._handler.1.cancel();
        self.channel
            .close()
            .await
            .map_err(|err| RabbitMQError::CloseChannelError(err.to_string()))
    }
}

/// Body of a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    content: Vec<u8>,
}

impl<T: AsRef<[u8]>> From<T> for Message {
    fn from(value: T) -> Self {
        Message {
            content: value.as_ref().to_vec(),
        }
    }
}

impl Message {
    pub fn new(content: Vec<u8>) -> Self {
        Self { content }
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }
}

/// Per-message metadata: a request id header and an optional message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherContext {
    request_id: String,
    message_id: Option<String>,
}

impl PublisherContext {
    pub fn new(req_id: &str, message_id: Option<String>) -> Self {
        Self {
            request_id: req_id.to_owned(),
            message_id,
        }
    }

    fn into_basic_props(self, current_basic_props: &BasicProperties) -> BasicProperties {
        let mut new_basic_props = current_basic_props.clone();
        if let Some(msg_id) = self.message_id {
            new_basic_props.with_message_id(&msg_id);
        }

        let mut headers = FieldTable::new();
        if let Ok(key) = ShortStr::try_from(REQUEST_ID_HEADER) {
            headers.insert(key, self.request_id.into());
        }
        new_basic_props.with_headers(headers);

        new_basic_props
    }
}

/// Error types for RabbitMQ operations
#[derive(Debug, thiserror::Error)]
pub enum RabbitMQError {
    /// Error in the provided URI
    #[error("Provided URI Error: {0}")]
    UriError(String),
    /// Error establishing or closing the connection
    #[error("Connection error: {0}")]
    ConnectionError(String),
    /// Error opening a channel
    #[error("Error while opening a rabbitmq channel: {0}")]
    OpenChannelError(String),
    /// Error declaring a queue
    #[error("Error while declaring a queue: {0}")]
    QueueDeclarationError(String),
    /// Error declaring an exchange
    #[error("Error while declaring a exchange: {0}")]
    ExchangeDeclarationError(String),
    /// Error starting to consume from a subscription
    #[error("Error while starting to consume from a subscription: {0}")]
    SubscriptionError(String),
    /// Error closing a channel
    #[error("Error while closing a channel: {0}")]
    CloseChannelError(String),
    /// The background publishing task is gone
    #[error("Error while publishing a message - channel was dropped or closed")]
    PublishError,
    /// The broker rejected an inline publish
    #[error("Error while sending a message: {0}")]
    SendError(String),
    /// Error while acknowledging a message
    #[error("Error while acknowledging a message: {0}")]
    AckMessageError(String),
    /// Message does not contain delivery tag
    #[error("Unexpected error: message does not contain delivery tag")]
    NotDeliveryTag,
}

async fn open_rabbit_connection(connection_string: &str) -> Result<Connection, RabbitMQError> {
    let open_conn_args = OpenConnectionArguments::try_from(connection_string).map_err(|err| {
        error!("Failed to parse connection string: {}", err);
        RabbitMQError::UriError(err.to_string())
    })?;

    let conn = Connection::open(&open_conn_args).await.map_err(|err| {
        error!("Failed to connect to RabbitMQ: {}", err);
        RabbitMQError::ConnectionError(err.to_string())
    })?;

    conn.register_callback(RabbitConnectionCallback)
        .await
        .map_err(|err| RabbitMQError::ConnectionError(err.to_string()))?;

    info!("RabbitMQ connection established");
    Ok(conn)
}

async fn open_rabbit_channel(conn: &Connection) -> Result<Channel, RabbitMQError> {
    let rabbit_channel = conn
        .open_channel(None)
        .await
        .map_err(|err| RabbitMQError::OpenChannelError(err.to_string()))?;

    rabbit_channel
        .register_callback(RabbitChannelCallback)
        .await
        .map_err(|err| RabbitMQError::OpenChannelError(err.to_string()))?;

    debug!("RabbitMQ channel opened");
    Ok(rabbit_channel)
}

struct RabbitConnectionCallback;

#[async_trait]
impl ConnectionCallback for RabbitConnectionCallback {
    async fn close(&mut self, _connection: &Connection, close: Close) -> Result<(), amqprs::error::Error> {
        debug!("connection closed {:?}", close);
        Ok(())
    }

    async fn blocked(&mut self, _connection: &Connection, reason: String) {
        debug!("connection blocked {:?}", reason);
    }

    async fn unblocked(&mut self, _connection: &Connection) {
        debug!("connection unblocked");
    }

    async fn secret_updated(&mut self, _connection: &Connection) {
        debug!("connection secret updated");
    }
}

struct RabbitChannelCallback;

#[async_trait]
impl ChannelCallback for RabbitChannelCallback {
    async fn close(&mut self, _channel: &Channel, close: amqprs::CloseChannel) -> Result<(), amqprs::error::Error> {
        debug!("channel closed {:?}", close);
        Ok(())
    }

    async fn cancel(&mut self, _channel: &Channel, cancel: Cancel) -> Result<(), amqprs::error::Error> {
        debug!("consumer cancelled {:?}", cancel);
        Ok(())
    }

    async fn flow(&mut self, _channel: &Channel, flow: bool) -> Result<bool, amqprs::error::Error> {
        debug!("channel flow {:?}", flow);
        Ok(true)
    }

    async fn publish_ack(&mut self, _channel: &Channel, _ack: Ack) {}

    async fn publish_nack(&mut self, _channel: &Channel, _nack: Nack) {}

    async fn publish_return(&mut self, _channel: &Channel, _return: Return, _props: BasicProperties, _content: Vec<u8>) {}
}
