use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use connect_config::{AwsSettings, RecordingSettings};
use std::path::Path;
use tracing::info;

/// Pushes finished composites to object storage. Absent a configured
/// bucket, recordings stay local-only.
pub struct ArtifactUploader {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    sse: Option<ServerSideEncryption>,
}

impl ArtifactUploader {
    pub async fn new(recording: &RecordingSettings, aws: &AwsSettings) -> Option<Self> {
        let bucket = recording.s3_bucket.clone().filter(|b| !b.is_empty())?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = aws.region.clone().filter(|r| !r.is_empty()) {
            loader = loader.region(aws_sdk_s3::config::Region::new(region));
        }
        let config = loader.load().await;

        let sse = recording
            .s3_sse
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| ServerSideEncryption::from(s));

        Some(Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket,
            prefix: recording.s3_prefix.clone(),
            sse,
        })
    }

    pub fn object_key(&self, room_id: &str, session_id: &str) -> String {
        format!("{}/{}/{}.mp4", self.prefix.trim_end_matches('/'), room_id, session_id)
    }

    /// Returns (bucket, key, size) on success.
    pub async fn upload(&self, local: &Path, key: &str) -> anyhow::Result<(String, String, u64)> {
        let size = tokio::fs::metadata(local).await?.len();
        let body = ByteStream::from_path(local).await?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("video/mp4")
            .body(body);
        if let Some(sse) = &self.sse {
            request = request.server_side_encryption(sse.clone());
        }
        request.send().await?;

        info!(bucket = %self.bucket, key, size, "recording uploaded");
        Ok((self.bucket.clone(), key.to_string(), size))
    }
}
