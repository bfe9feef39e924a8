//! HTTP transport types for the host-does-IO pattern.
//!
//! # Design
//! These types describe a Book API call as plain data. `BookClient` builds
//! `HttpRequest` values and parses `HttpResponse` values without touching the
//! network; a `Transport` executes the round-trip in between.
//!
//! The Book API is POST-only against a single endpoint, so a request is just
//! the endpoint URL plus a body: either form fields or a multipart form
//! carrying one file.

/// One file attached to a multipart request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    /// Form field name the server reads the file from.
    pub name: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Body of a Book API request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// `application/x-www-form-urlencoded` fields, in order.
    Form(Vec<(String, String)>),
    /// `multipart/form-data` text fields followed by a single file.
    Multipart {
        fields: Vec<(String, String)>,
        file: FilePart,
    },
}

impl RequestBody {
    /// Text fields of the body, regardless of encoding.
    pub fn fields(&self) -> &[(String, String)] {
        match self {
            RequestBody::Form(fields) => fields,
            RequestBody::Multipart { fields, .. } => fields,
        }
    }

    /// First value of the named text field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields()
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// A POST request described as plain data.
///
/// Built by `BookClient::build_*` methods. A `Transport` executes it and
/// returns the corresponding `HttpResponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub body: RequestBody,
}

impl HttpRequest {
    /// The `req` discriminator selecting the remote operation.
    pub fn operation(&self) -> Option<&str> {
        self.body.field("req")
    }
}

/// An HTTP response described as plain data.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    /// Shorthand for a 200 response carrying `body`.
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_lookup_returns_first_match() {
        let body = RequestBody::Form(vec![
            ("req".to_string(), "getTableValues".to_string()),
            ("catId".to_string(), "7".to_string()),
            ("catId".to_string(), "8".to_string()),
        ]);
        assert_eq!(body.field("catId"), Some("7"));
        assert_eq!(body.field("missing"), None);
    }

    #[test]
    fn operation_reads_req_field_from_multipart() {
        let req = HttpRequest {
            url: "http://localhost/api.php".to_string(),
            body: RequestBody::Multipart {
                fields: vec![("req".to_string(), "fileUpload".to_string())],
                file: FilePart {
                    name: "qqfile".to_string(),
                    file_name: "a.txt".to_string(),
                    content_type: "text/plain".to_string(),
                    bytes: b"hello".to_vec(),
                },
            },
        };
        assert_eq!(req.operation(), Some("fileUpload"));
    }
}
