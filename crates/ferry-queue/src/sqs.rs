use async_trait::async_trait;
use aws_sdk_sqs::primitives::Blob;
use aws_sdk_sqs::types::{
    DeleteMessageBatchRequestEntry, MessageAttributeValue as SqsAttributeValue,
    MessageSystemAttributeName, QueueAttributeName, SendMessageBatchRequestEntry,
};
use aws_sdk_sqs::Client;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use ferry_common::{Message, MessageAttributeValue};
use crate::{
    BatchFailure, DeleteBatchOutcome, QueueAttributes, QueueClient, QueueError, ReceiveOptions,
    Result, SendBatchOutcome, SendMessage, SendMessageEntry,
};

/// Build an SQS client from the ambient AWS configuration.
///
/// `endpoint` points the client at a local emulator (LocalStack and friends).
pub async fn client_from_env(region: Option<&str>, endpoint: Option<&str>) -> Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(aws_config::Region::new(region.to_string()));
    }
    if let Some(endpoint) = endpoint {
        info!(endpoint = %endpoint, "Configuring SQS client with custom endpoint");
        loader = loader.endpoint_url(endpoint);
    }
    let config = loader.load().await;
    Client::new(&config)
}

/// AWS SQS transport
#[derive(Clone)]
pub struct SqsQueueClient {
    client: Client,
}

impl SqsQueueClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn convert_message(sqs_msg: aws_sdk_sqs::types::Message) -> Result<Message> {
        let receipt_handle = sqs_msg
            .receipt_handle()
            .ok_or_else(|| QueueError::Sqs("Missing receipt handle".to_string()))?
            .to_string();

        let attributes = sqs_msg
            .attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let message_attributes = sqs_msg
            .message_attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .filter_map(|(name, value)| from_sqs_attribute(value).map(|v| (name.clone(), v)))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Message {
            message_id: sqs_msg.message_id().unwrap_or_default().to_string(),
            body: sqs_msg.body().unwrap_or_default().to_string(),
            receipt_handle,
            attributes,
            message_attributes,
            md5_of_body: sqs_msg.md5_of_body().map(|s| s.to_string()),
        })
    }
}

fn from_sqs_attribute(value: &SqsAttributeValue) -> Option<MessageAttributeValue> {
    let data_type = value.data_type();
    if data_type.starts_with("Binary") {
        value
            .binary_value()
            .map(|blob| MessageAttributeValue::Binary(blob.as_ref().to_vec()))
    } else if data_type.starts_with("Number") {
        value.string_value().map(|s| MessageAttributeValue::Number(s.to_string()))
    } else {
        value.string_value().map(|s| MessageAttributeValue::String(s.to_string()))
    }
}

fn to_sqs_attributes(
    attributes: &HashMap<String, MessageAttributeValue>,
) -> Result<Option<HashMap<String, SqsAttributeValue>>> {
    if attributes.is_empty() {
        return Ok(None);
    }

    let mut converted = HashMap::with_capacity(attributes.len());
    for (name, value) in attributes {
        let builder = SqsAttributeValue::builder().data_type(value.data_type());
        let builder = match value {
            MessageAttributeValue::String(s) | MessageAttributeValue::Number(s) => builder.string_value(s),
            MessageAttributeValue::Binary(bytes) => builder.binary_value(Blob::new(bytes.clone())),
        };
        let built = builder
            .build()
            .map_err(|e| QueueError::InvalidMessage(e.to_string()))?;
        converted.insert(name.clone(), built);
    }
    Ok(Some(converted))
}

fn batch_failure(entry: &aws_sdk_sqs::types::BatchResultErrorEntry) -> BatchFailure {
    BatchFailure {
        id: entry.id().to_string(),
        code: entry.code().to_string(),
        message: entry.message().map(|s| s.to_string()),
    }
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn get_queue_url(&self, name: &str) -> Result<String> {
        let result = self.client.get_queue_url().queue_name(name).send().await;

        match result {
            Ok(output) => output
                .queue_url()
                .map(|url| url.to_string())
                .ok_or_else(|| QueueError::NonExistentQueue(name.to_string())),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_queue_does_not_exist() {
                    Err(QueueError::NonExistentQueue(name.to_string()))
                } else {
                    Err(QueueError::Sqs(service_error.to_string()))
                }
            }
        }
    }

    async fn get_queue_attributes(&self, url: &str) -> Result<QueueAttributes> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(url)
            .attribute_names(QueueAttributeName::VisibilityTimeout)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let visibility_timeout = result
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::VisibilityTimeout))
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| QueueError::Sqs(format!("Queue {} reported no visibility timeout", url)))?;

        Ok(QueueAttributes { visibility_timeout })
    }

    async fn receive_messages(&self, url: &str, options: &ReceiveOptions) -> Result<Vec<Message>> {
        let result = self
            .client
            .receive_message()
            .queue_url(url)
            .max_number_of_messages(options.max_messages as i32)
            .set_wait_time_seconds(options.wait_time_seconds)
            .set_visibility_timeout(options.visibility_timeout)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let sqs_messages = result.messages.unwrap_or_default();
        let mut messages = Vec::with_capacity(sqs_messages.len());

        for sqs_msg in sqs_messages {
            match Self::convert_message(sqs_msg) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(queue_url = %url, error = %e, "Skipping malformed SQS message"),
            }
        }

        if !messages.is_empty() {
            debug!(queue_url = %url, count = messages.len(), "Received messages from SQS");
        }

        Ok(messages)
    }

    async fn change_message_visibility(
        &self,
        url: &str,
        receipt_handle: &str,
        visibility_timeout: u32,
    ) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(visibility_timeout as i32)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        debug!(queue_url = %url, visibility_timeout, "Visibility changed in SQS");
        Ok(())
    }

    async fn delete_message_batch(&self, url: &str, receipt_handles: &[String]) -> Result<DeleteBatchOutcome> {
        let entries = receipt_handles
            .iter()
            .enumerate()
            .map(|(index, handle)| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(index.to_string())
                    .receipt_handle(handle)
                    .build()
                    .map_err(|e| QueueError::Sqs(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let result = self
            .client
            .delete_message_batch()
            .queue_url(url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        Ok(DeleteBatchOutcome {
            successful: result.successful().iter().map(|e| e.id().to_string()).collect(),
            failed: result.failed().iter().map(batch_failure).collect(),
        })
    }

    async fn send_message(&self, url: &str, message: &SendMessage) -> Result<String> {
        let result = self
            .client
            .send_message()
            .queue_url(url)
            .message_body(&message.body)
            .set_delay_seconds(message.delay_seconds.map(|d| d as i32))
            .set_message_attributes(to_sqs_attributes(&message.message_attributes)?)
            .set_message_group_id(message.message_group_id.clone())
            .set_message_deduplication_id(message.message_deduplication_id.clone())
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        Ok(result.message_id().unwrap_or_default().to_string())
    }

    async fn send_message_batch(&self, url: &str, entries: &[SendMessageEntry]) -> Result<SendBatchOutcome> {
        let request_entries = entries
            .iter()
            .map(|entry| {
                SendMessageBatchRequestEntry::builder()
                    .id(&entry.id)
                    .message_body(&entry.message.body)
                    .set_delay_seconds(entry.message.delay_seconds.map(|d| d as i32))
                    .set_message_attributes(to_sqs_attributes(&entry.message.message_attributes)?)
                    .set_message_group_id(entry.message.message_group_id.clone())
                    .set_message_deduplication_id(entry.message.message_deduplication_id.clone())
                    .build()
                    .map_err(|e| QueueError::Sqs(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let result = self
            .client
            .send_message_batch()
            .queue_url(url)
            .set_entries(Some(request_entries))
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        Ok(SendBatchOutcome {
            successful: result
                .successful()
                .iter()
                .map(|e| (e.id().to_string(), e.message_id().to_string()))
                .collect(),
            failed: result.failed().iter().map(batch_failure).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_conversion() {
        let mut attributes = HashMap::new();
        attributes.insert("worker".to_string(), MessageAttributeValue::String("Mailer".to_string()));
        attributes.insert("attempt".to_string(), MessageAttributeValue::Number("2".to_string()));

        let converted = to_sqs_attributes(&attributes).unwrap().unwrap();
        assert_eq!(converted["worker"].data_type(), "String");
        assert_eq!(converted["worker"].string_value(), Some("Mailer"));
        assert_eq!(from_sqs_attribute(&converted["attempt"]), Some(MessageAttributeValue::Number("2".to_string())));
    }

    #[test]
    fn test_empty_attributes_omitted() {
        assert!(to_sqs_attributes(&HashMap::new()).unwrap().is_none());
    }
}
