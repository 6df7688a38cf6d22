//! [`WorkspaceApi`] over the Notion REST API.

use crate::api::{
    CoverUpdate, DatabaseSchema, FileUpload, FileUploadRequest, InsertPosition, PageParent,
    PageSummary, PageUpdate, RemoteBlock, UploadMode, UploadStatus, WorkspaceApi,
};
use bytes::Bytes;
use http::header::{AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER};
use pagesync_common::{ApiConfig, BlockId, DatabaseId, PageId, RemoteError, UploadId};
use reqwest::{Method, RequestBuilder, multipart};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::trace;
use url::Url;

const PAGE_SIZE: &str = "100";

pub struct NotionClient {
    pub client: reqwest::Client,
    base_url: Url,
}

impl NotionClient {
    pub fn new(config: &ApiConfig) -> Result<Self, RemoteError> {
        let mut headers = HeaderMap::new();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| RemoteError::permanent("client", "token is not a valid header value"))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(
            "notion-version",
            HeaderValue::from_str(&config.notion_version)
                .map_err(|_| RemoteError::permanent("client", "invalid Notion-Version value"))?,
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RemoteError::permanent("client", e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    fn request(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
    ) -> Result<RequestBuilder, RemoteError> {
        let url = self
            .base_url
            .join(&format!("v1/{path}"))
            .map_err(|e| RemoteError::permanent(operation, format!("bad url for {path}: {e}")))?;
        Ok(self.client.request(method, url))
    }

    async fn send(&self, operation: &'static str, request: RequestBuilder) -> Result<Value, RemoteError> {
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(operation, e))?;
        trace!(operation, status = status.as_u16(), bytes = body.len(), "response");

        if status.is_success() {
            if body.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_slice(&body).map_err(|e| {
                RemoteError::permanent(operation, format!("malformed response body: {e}"))
            });
        }

        let error: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        let message = error["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
        Err(RemoteError::from_status(
            operation,
            status.as_u16(),
            error["code"].as_str().map(str::to_string),
            message,
        )
        .with_retry_after(retry_after))
    }

    /// Follow `next_cursor` until the listing is exhausted.
    async fn paginate(
        &self,
        operation: &'static str,
        mut page: impl FnMut(Option<&str>) -> Result<RequestBuilder, RemoteError>,
    ) -> Result<Vec<Value>, RemoteError> {
        let mut results = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let body = self.send(operation, page(cursor.as_deref())?).await?;
            if let Some(items) = body["results"].as_array() {
                results.extend(items.iter().cloned());
            }
            match (body["has_more"].as_bool(), body["next_cursor"].as_str()) {
                (Some(true), Some(next)) => cursor = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(results)
    }
}

fn transport_error(operation: &'static str, err: reqwest::Error) -> RemoteError {
    if err.is_builder() {
        RemoteError::permanent(operation, err.to_string())
    } else {
        // timeouts, refused connections and truncated bodies
        RemoteError::transient(operation, err.to_string())
    }
}

fn parse_block(value: &Value) -> Option<RemoteBlock> {
    let block_type = value["type"].as_str()?.to_string();
    Some(RemoteBlock {
        id: BlockId::new(value["id"].as_str()?),
        has_children: value["has_children"].as_bool().unwrap_or(false),
        payload: value[block_type.as_str()].clone(),
        block_type,
    })
}

fn parse_upload(operation: &'static str, value: &Value) -> Result<FileUpload, RemoteError> {
    let id = value["id"]
        .as_str()
        .ok_or_else(|| RemoteError::permanent(operation, "file upload without id"))?;
    Ok(FileUpload {
        id: UploadId::new(id),
        status: UploadStatus::parse(value["status"].as_str().unwrap_or("pending")),
    })
}

fn title_value(title: &str) -> Value {
    json!({ "title": [{ "type": "text", "text": { "content": title } }] })
}

fn cover_value(cover: &CoverUpdate) -> Option<Value> {
    match cover {
        CoverUpdate::Keep => None,
        CoverUpdate::Clear => Some(Value::Null),
        CoverUpdate::External(url) => Some(json!({ "type": "external", "external": { "url": url } })),
        CoverUpdate::Uploaded(id) => {
            Some(json!({ "type": "file_upload", "file_upload": { "id": id } }))
        }
    }
}

impl WorkspaceApi for NotionClient {
    async fn create_page(
        &self,
        parent: &PageParent,
        title_property: &str,
        title: &str,
    ) -> Result<PageId, RemoteError> {
        const OP: &str = "create_page";
        let parent = match parent {
            PageParent::Page(id) => json!({ "page_id": id }),
            PageParent::Database(id) => json!({ "database_id": id }),
        };
        let body = json!({
            "parent": parent,
            "properties": { title_property: title_value(title) },
        });
        let page = self
            .send(OP, self.request(OP, Method::POST, "pages")?.json(&body))
            .await?;
        page["id"]
            .as_str()
            .map(PageId::new)
            .ok_or_else(|| RemoteError::permanent(OP, "created page without id"))
    }

    async fn update_page(&self, page: &PageId, update: &PageUpdate) -> Result<(), RemoteError> {
        const OP: &str = "update_page";
        let mut body = serde_json::Map::new();
        body.insert(
            "icon".into(),
            match &update.icon {
                Some(emoji) => json!({ "type": "emoji", "emoji": emoji }),
                None => Value::Null,
            },
        );
        if let Some(cover) = cover_value(&update.cover) {
            body.insert("cover".into(), cover);
        }
        let request = self
            .request(OP, Method::PATCH, &format!("pages/{page}"))?
            .json(&body);
        self.send(OP, request).await.map(drop)
    }

    async fn delete_page(&self, page: &PageId) -> Result<(), RemoteError> {
        const OP: &str = "delete_page";
        let request = self
            .request(OP, Method::PATCH, &format!("pages/{page}"))?
            .json(&json!({ "archived": true }));
        self.send(OP, request).await.map(drop)
    }

    async fn append_block_children(
        &self,
        parent: &BlockId,
        children: &[Value],
        position: &InsertPosition,
    ) -> Result<Vec<BlockId>, RemoteError> {
        const OP: &str = "append_block_children";
        let request = self
            .request(OP, Method::PATCH, &format!("blocks/{parent}/children"))?
            .json(&append_body(children, position));
        let created = self.send(OP, request).await?;
        created["results"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["id"].as_str().map(BlockId::new))
                    .collect()
            })
            .ok_or_else(|| RemoteError::permanent(OP, "append response without results"))
    }

    async fn update_block(&self, id: &BlockId, body: &Value) -> Result<(), RemoteError> {
        const OP: &str = "update_block";
        let request = self
            .request(OP, Method::PATCH, &format!("blocks/{id}"))?
            .json(body);
        self.send(OP, request).await.map(drop)
    }

    async fn delete_block(&self, id: &BlockId) -> Result<(), RemoteError> {
        const OP: &str = "delete_block";
        let request = self.request(OP, Method::DELETE, &format!("blocks/{id}"))?;
        self.send(OP, request).await.map(drop)
    }

    async fn list_block_children(&self, parent: &BlockId) -> Result<Vec<RemoteBlock>, RemoteError> {
        const OP: &str = "list_block_children";
        let path = format!("blocks/{parent}/children");
        let items = self
            .paginate(OP, |cursor| {
                let mut query = vec![("page_size", PAGE_SIZE)];
                if let Some(cursor) = cursor {
                    query.push(("start_cursor", cursor));
                }
                Ok(self.request(OP, Method::GET, &path)?.query(&query))
            })
            .await?;
        Ok(items.iter().filter_map(parse_block).collect())
    }

    async fn list_discussions(&self, id: &BlockId) -> Result<usize, RemoteError> {
        const OP: &str = "list_discussions";
        let items = self
            .paginate(OP, |cursor| {
                let mut query = vec![("block_id", id.as_str()), ("page_size", PAGE_SIZE)];
                if let Some(cursor) = cursor {
                    query.push(("start_cursor", cursor));
                }
                Ok(self.request(OP, Method::GET, "comments")?.query(&query))
            })
            .await?;
        let threads: BTreeSet<&str> = items
            .iter()
            .filter_map(|c| c["discussion_id"].as_str())
            .collect();
        Ok(threads.len())
    }

    async fn create_file_upload(&self, request: &FileUploadRequest) -> Result<FileUpload, RemoteError> {
        const OP: &str = "create_file_upload";
        let mut body = json!({
            "filename": request.filename,
            "content_type": request.content_type,
        });
        match request.mode {
            UploadMode::SinglePart => body["mode"] = json!("single_part"),
            UploadMode::MultiPart { parts } => {
                body["mode"] = json!("multi_part");
                body["number_of_parts"] = json!(parts);
            }
        }
        let created = self
            .send(OP, self.request(OP, Method::POST, "file_uploads")?.json(&body))
            .await?;
        parse_upload(OP, &created)
    }

    async fn send_file_upload(
        &self,
        id: &UploadId,
        part: Option<u32>,
        request: &FileUploadRequest,
        bytes: Bytes,
    ) -> Result<(), RemoteError> {
        const OP: &str = "send_file_upload";
        let file = multipart::Part::stream(bytes)
            .file_name(request.filename.clone())
            .mime_str(&request.content_type)
            .map_err(|e| RemoteError::permanent(OP, e.to_string()))?;
        let mut form = multipart::Form::new().part("file", file);
        if let Some(part) = part {
            form = form.text("part_number", part.to_string());
        }
        let builder = self
            .request(OP, Method::POST, &format!("file_uploads/{id}/send"))?
            .multipart(form);
        self.send(OP, builder).await.map(drop)
    }

    async fn complete_file_upload(&self, id: &UploadId) -> Result<(), RemoteError> {
        const OP: &str = "complete_file_upload";
        let request = self.request(OP, Method::POST, &format!("file_uploads/{id}/complete"))?;
        self.send(OP, request).await.map(drop)
    }

    async fn get_file_upload(&self, id: &UploadId) -> Result<FileUpload, RemoteError> {
        const OP: &str = "get_file_upload";
        let request = self.request(OP, Method::GET, &format!("file_uploads/{id}"))?;
        let upload = self.send(OP, request).await?;
        parse_upload(OP, &upload)
    }

    async fn retrieve_database(&self, database: &DatabaseId) -> Result<DatabaseSchema, RemoteError> {
        const OP: &str = "retrieve_database";
        let request = self.request(OP, Method::GET, &format!("databases/{database}"))?;
        let db = self.send(OP, request).await?;
        db["properties"]
            .as_object()
            .and_then(|props| {
                props
                    .iter()
                    .find(|(_, prop)| prop["type"] == "title")
                    .map(|(name, _)| name.clone())
            })
            .map(|title_property| DatabaseSchema { title_property })
            .ok_or_else(|| RemoteError::permanent(OP, "database has no title property"))
    }

    async fn query_database(
        &self,
        database: &DatabaseId,
        title_property: &str,
    ) -> Result<Vec<PageSummary>, RemoteError> {
        const OP: &str = "query_database";
        let path = format!("databases/{database}/query");
        let items = self
            .paginate(OP, |cursor| {
                let mut body = json!({ "page_size": 100 });
                if let Some(cursor) = cursor {
                    body["start_cursor"] = json!(cursor);
                }
                Ok(self.request(OP, Method::POST, &path)?.json(&body))
            })
            .await?;
        Ok(items
            .iter()
            .filter_map(|page| {
                let id = page["id"].as_str()?;
                let title = page["properties"][title_property]["title"]
                    .as_array()
                    .map(|runs| {
                        runs.iter()
                            .filter_map(|r| r["plain_text"].as_str())
                            .collect::<String>()
                    })
                    .unwrap_or_default();
                Some(PageSummary {
                    id: PageId::new(id),
                    title,
                })
            })
            .collect())
    }
}

fn append_body(children: &[Value], position: &InsertPosition) -> Value {
    let mut body = json!({ "children": children });
    if let InsertPosition::After(id) = position {
        body["after"] = json!(id);
    }
    body
}
