//! File upload and realtime token routes

use anyhow::{Context, Result};
use serde::Deserialize;

use super::client::{json_body, GatewayClient};
use super::MediaUpload;

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(alias = "file_url", alias = "fileUrl")]
    url: Option<String>,
    data: Option<Box<UploadResponse>>,
}

impl UploadResponse {
    fn into_url(self) -> Option<String> {
        self.url.or_else(|| self.data.and_then(|d| d.into_url()))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token", alias = "ws_token")]
    token: Option<String>,
}

impl GatewayClient {
    /// `POST /api/files/upload-<kind>` with the file as multipart `file`.
    pub(super) async fn upload(
        &self,
        upload: &MediaUpload,
        form: reqwest::multipart::Form,
    ) -> Result<String> {
        let route = format!("upload-{}", upload.kind().upload_suffix());
        let url = self.url(&["files", &route])?;

        tracing::debug!("Uploading {} ({} bytes)", upload.file_name, upload.size());
        let body = json_body(self.post_multipart(url, form).await?).await?;
        let parsed: UploadResponse =
            serde_json::from_value(body).context("Failed to parse upload response")?;
        parsed.into_url().context("Upload response has no url")
    }

    /// `GET /api/websocket/token`.
    pub(super) async fn fetch_websocket_token(&self) -> Result<String> {
        let url = self.url(&["websocket", "token"])?;
        let body = json_body(self.get(url).await?).await?;
        let parsed: TokenResponse =
            serde_json::from_value(body).context("Failed to parse websocket token response")?;
        parsed
            .token
            .filter(|t| !t.is_empty())
            .context("Websocket token response has no token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_response_shapes() {
        let flat: UploadResponse =
            serde_json::from_str(r#"{"url":"https://cdn/a.png"}"#).unwrap();
        assert_eq!(flat.into_url().as_deref(), Some("https://cdn/a.png"));

        let nested: UploadResponse =
            serde_json::from_str(r#"{"data":{"file_url":"https://cdn/b.png"}}"#).unwrap();
        assert_eq!(nested.into_url().as_deref(), Some("https://cdn/b.png"));

        let empty: UploadResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.into_url(), None);
    }

    #[test]
    fn test_token_response_alias() {
        let t: TokenResponse = serde_json::from_str(r#"{"access_token":"jwt"}"#).unwrap();
        assert_eq!(t.token.as_deref(), Some("jwt"));
    }
}
