//! Object-store operations.
//!
//! The four calls the cache core needs: ranged reads of an object, and the
//! three building blocks of a mixed multi-part upload (upload a part from
//! local bytes, copy a part server-side from the existing object, complete
//! the upload from the collected part ETags).

use bytes::Bytes;
use http::header::{ETAG, RANGE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tracing::debug;

use crate::error::{HttpClientError, StoreError};
use crate::http_client::{HttpClient, HttpRequest, HttpResponse};

/// One completed part of a multi-part upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartEtag {
    /// 1-based part number.
    pub part_number: u16,
    /// The ETag the server assigned to the part.
    pub etag: String,
}

/// Client for one bucket of an S3-style object store.
///
/// Generic over the HTTP backend; the default deployment uses
/// [`UreqClient`](crate::UreqClient). Default headers (authorization,
/// custom metadata) are attached to every request.
pub struct BlobStore<C: HttpClient> {
    client: C,
    endpoint: String,
    bucket: String,
    default_headers: HeaderMap,
}

impl<C: HttpClient> BlobStore<C> {
    pub fn new(client: C, endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            default_headers: HeaderMap::new(),
        }
    }

    /// Headers to attach to every request (e.g. authorization supplied by
    /// the embedding application).
    pub fn with_default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = headers;
        self
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.bucket,
            key
        )
    }

    fn send(
        &mut self,
        method: Method,
        url: String,
        mut headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<HttpResponse, StoreError> {
        for (name, value) in &self.default_headers {
            headers.insert(name.clone(), value.clone());
        }
        Ok(self.client.send(HttpRequest {
            method,
            url,
            headers,
            body,
        })?)
    }

    /// Fetch `[offset, offset + bytes)` of the object.
    pub fn get_object_range(
        &mut self,
        key: &str,
        offset: i64,
        bytes: i64,
    ) -> Result<Bytes, StoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            RANGE,
            header_value(format!("bytes={}-{}", offset, offset + bytes - 1))?,
        );

        let resp = self.send(Method::GET, self.object_url(key), headers, None)?;
        match resp.status {
            StatusCode::PARTIAL_CONTENT | StatusCode::OK => Ok(resp.body),
            status => Err(StoreError::UnexpectedStatus {
                operation: "ranged get",
                status,
            }),
        }
    }

    /// Upload one part from local bytes. Returns the part's ETag.
    pub fn upload_part(
        &mut self,
        key: &str,
        upload_id: &str,
        part_number: u16,
        body: Bytes,
    ) -> Result<String, StoreError> {
        let url = format!(
            "{}?partNumber={}&uploadId={}",
            self.object_url(key),
            part_number,
            upload_id
        );
        let resp = self.send(Method::PUT, url, HeaderMap::new(), Some(body))?;
        if resp.status != StatusCode::OK {
            return Err(StoreError::UnexpectedStatus {
                operation: "upload part",
                status: resp.status,
            });
        }
        let etag = resp
            .headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_owned())
            .ok_or(StoreError::MissingEtag {
                operation: "upload part",
            })?;
        debug!(key, part_number, etag = %etag, "part uploaded");
        Ok(etag)
    }

    /// Copy `[offset, offset + bytes)` of the existing remote object as one
    /// part, server-side. Returns the part's ETag.
    pub fn upload_part_copy(
        &mut self,
        key: &str,
        upload_id: &str,
        part_number: u16,
        offset: i64,
        bytes: i64,
    ) -> Result<String, StoreError> {
        let url = format!(
            "{}?partNumber={}&uploadId={}",
            self.object_url(key),
            part_number,
            upload_id
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-amz-copy-source",
            header_value(format!("/{}/{}", self.bucket, key))?,
        );
        headers.insert(
            "x-amz-copy-source-range",
            header_value(format!("bytes={}-{}", offset, offset + bytes - 1))?,
        );

        let resp = self.send(Method::PUT, url, headers, None)?;
        if resp.status != StatusCode::OK {
            return Err(StoreError::UnexpectedStatus {
                operation: "copy part",
                status: resp.status,
            });
        }
        // The ETag of a copied part arrives in the XML body, not a header.
        let body = String::from_utf8_lossy(&resp.body).into_owned();
        let etag = extract_xml_field(&body, "ETag")
            .map(|v| v.replace("&quot;", "").trim_matches('"').to_owned())
            .ok_or(StoreError::MissingEtag {
                operation: "copy part",
            })?;
        debug!(key, part_number, etag = %etag, "part copied");
        Ok(etag)
    }

    /// Complete the multi-part upload from the collected parts, which must
    /// be in part-number order.
    pub fn complete_multipart_upload(
        &mut self,
        key: &str,
        upload_id: &str,
        parts: &[PartEtag],
    ) -> Result<(), StoreError> {
        let url = format!("{}?uploadId={}", self.object_url(key), upload_id);

        let mut xml = String::from("<CompleteMultipartUpload>");
        for part in parts {
            xml.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
                part.part_number, part.etag
            ));
        }
        xml.push_str("</CompleteMultipartUpload>");

        let resp = self.send(Method::POST, url, HeaderMap::new(), Some(Bytes::from(xml)))?;
        if resp.status != StatusCode::OK {
            return Err(StoreError::UnexpectedStatus {
                operation: "complete multipart",
                status: resp.status,
            });
        }
        debug!(key, parts = parts.len(), "multi-part upload completed");
        Ok(())
    }
}

fn header_value(value: String) -> Result<HeaderValue, StoreError> {
    HeaderValue::from_str(&value).map_err(|e| StoreError::InvalidRequest(e.to_string()))
}

/// Pull the text content of the first `<tag>...</tag>` pair out of an XML
/// body. The store's answers are flat enough that full XML parsing would
/// be dead weight.
fn extract_xml_field(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Backend that records requests and plays back canned responses.
    struct MockClient {
        requests: Vec<HttpRequest>,
        responses: VecDeque<HttpResponse>,
    }

    impl MockClient {
        fn with_responses(responses: Vec<HttpResponse>) -> Self {
            Self {
                requests: Vec::new(),
                responses: responses.into(),
            }
        }
    }

    impl HttpClient for MockClient {
        fn send(&mut self, request: HttpRequest) -> Result<HttpResponse, HttpClientError> {
            self.requests.push(request);
            self.responses
                .pop_front()
                .ok_or_else(|| HttpClientError::Connection("no canned response".to_owned()))
        }
    }

    fn response(status: StatusCode, headers: &[(&str, &str)], body: &[u8]) -> HttpResponse {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            header_map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        HttpResponse {
            status,
            headers: header_map,
            body: Bytes::copy_from_slice(body),
        }
    }

    fn store(responses: Vec<HttpResponse>) -> BlobStore<MockClient> {
        BlobStore::new(
            MockClient::with_responses(responses),
            "https://store.example.com/",
            "bucket",
        )
    }

    #[test]
    fn ranged_get_sends_range_header() {
        let mut store = store(vec![response(
            StatusCode::PARTIAL_CONTENT,
            &[],
            b"abcdef",
        )]);

        let body = store.get_object_range("dir/obj", 100, 6).unwrap();
        assert_eq!(&body[..], b"abcdef");

        let request = &store.client_mut().requests[0];
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.url, "https://store.example.com/bucket/dir/obj");
        assert_eq!(
            request.headers.get(RANGE).unwrap(),
            &HeaderValue::from_static("bytes=100-105")
        );
    }

    #[test]
    fn ranged_get_rejects_other_statuses() {
        let mut store = store(vec![response(StatusCode::FORBIDDEN, &[], b"")]);
        let err = store.get_object_range("obj", 0, 10).unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnexpectedStatus {
                status: StatusCode::FORBIDDEN,
                ..
            }
        ));
    }

    #[test]
    fn upload_part_returns_header_etag() {
        let mut store = store(vec![response(
            StatusCode::OK,
            &[("etag", "\"abc123\"")],
            b"",
        )]);

        let etag = store
            .upload_part("obj", "uid-1", 3, Bytes::from_static(b"data"))
            .unwrap();
        assert_eq!(etag, "abc123");

        let request = &store.client_mut().requests[0];
        assert_eq!(request.method, Method::PUT);
        assert_eq!(
            request.url,
            "https://store.example.com/bucket/obj?partNumber=3&uploadId=uid-1"
        );
        assert_eq!(request.body.as_deref(), Some(b"data".as_slice()));
    }

    #[test]
    fn upload_part_without_etag_fails() {
        let mut store = store(vec![response(StatusCode::OK, &[], b"")]);
        let err = store
            .upload_part("obj", "uid-1", 1, Bytes::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingEtag { .. }));
    }

    #[test]
    fn copy_part_parses_etag_from_xml() {
        let body = b"<CopyPartResult><ETag>&quot;feed42&quot;</ETag></CopyPartResult>";
        let mut store = store(vec![response(StatusCode::OK, &[], body)]);

        let etag = store.upload_part_copy("obj", "uid-1", 2, 0, 1024).unwrap();
        assert_eq!(etag, "feed42");

        let request = &store.client_mut().requests[0];
        assert_eq!(
            request.headers.get("x-amz-copy-source").unwrap(),
            &HeaderValue::from_static("/bucket/obj")
        );
        assert_eq!(
            request.headers.get("x-amz-copy-source-range").unwrap(),
            &HeaderValue::from_static("bytes=0-1023")
        );
    }

    #[test]
    fn complete_builds_part_list_in_order() {
        let mut store = store(vec![response(StatusCode::OK, &[], b"")]);

        let parts = vec![
            PartEtag {
                part_number: 1,
                etag: "aaa".into(),
            },
            PartEtag {
                part_number: 2,
                etag: "bbb".into(),
            },
        ];
        store
            .complete_multipart_upload("obj", "uid-9", &parts)
            .unwrap();

        let request = &store.client_mut().requests[0];
        assert_eq!(request.method, Method::POST);
        assert_eq!(
            request.url,
            "https://store.example.com/bucket/obj?uploadId=uid-9"
        );
        let xml = String::from_utf8(request.body.clone().unwrap().to_vec()).unwrap();
        assert_eq!(
            xml,
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>\"aaa\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"bbb\"</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[test]
    fn default_headers_are_attached() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok"));
        let mut store = BlobStore::new(
            MockClient::with_responses(vec![response(StatusCode::OK, &[], b"x")]),
            "https://store.example.com",
            "bucket",
        )
        .with_default_headers(headers);

        store.get_object_range("obj", 0, 1).unwrap();
        let request = &store.client_mut().requests[0];
        assert_eq!(
            request.headers.get("authorization").unwrap(),
            &HeaderValue::from_static("Bearer tok")
        );
    }
}
