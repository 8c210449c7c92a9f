//! Document operations: what is fed, with which parameters, and how it turned out.

use std::{
    fmt::{self, Display, Write},
    time::Duration,
};

use bytes::Bytes;

use crate::transport::{HttpRequest, Method};

/// Identifies a single document in the cluster.
///
/// Operations on the same id are always executed in the order they were enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId {
    namespace: String,
    document_type: String,
    group: Option<Group>,
    user_specific: String,
}

/// Optional location modifier of a [DocumentId].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Group {
    /// `n=<number>`
    Number(u64),
    /// `g=<group>`
    Name(String),
}

/// The kinds of mutation that can be fed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// Write a complete document.
    Put,
    /// Partially update a document.
    Update,
    /// Remove a document.
    Remove,
}

/// Per-operation settings.
///
/// Every setter returns a new value; invalid values panic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationParameters {
    create_if_missing: bool,
    test_and_set_condition: Option<String>,
    timeout: Option<Duration>,
    route: Option<String>,
    trace_level: Option<u8>,
}

/// How an operation ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    /// The operation was applied (or the document to remove did not exist).
    Success,
    /// The test-and-set condition did not match.
    ConditionNotMet,
    /// The operation could not be applied.
    Failure,
}

/// The final outcome of an enqueued operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    result_type: ResultType,
    document_id: DocumentId,
    message: Option<String>,
}

impl DocumentId {
    /// `id:<namespace>:<document_type>::<user_specific>`
    pub fn of(
        namespace: impl Into<String>,
        document_type: impl Into<String>,
        user_specific: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        let document_type = document_type.into();
        assert!(!namespace.is_empty(), "namespace must be non-empty");
        assert!(!document_type.is_empty(), "document type must be non-empty");
        Self {
            namespace,
            document_type,
            group: None,
            user_specific: user_specific.into(),
        }
    }

    /// `id:<namespace>:<document_type>:n=<number>:<user_specific>`
    pub fn of_number(
        namespace: impl Into<String>,
        document_type: impl Into<String>,
        number: u64,
        user_specific: impl Into<String>,
    ) -> Self {
        Self {
            group: Some(Group::Number(number)),
            ..Self::of(namespace, document_type, user_specific)
        }
    }

    /// `id:<namespace>:<document_type>:g=<group>:<user_specific>`
    pub fn of_group(
        namespace: impl Into<String>,
        document_type: impl Into<String>,
        group: impl Into<String>,
        user_specific: impl Into<String>,
    ) -> Self {
        let group = group.into();
        assert!(!group.is_empty(), "group must be non-empty");
        Self {
            group: Some(Group::Name(group)),
            ..Self::of(namespace, document_type, user_specific)
        }
    }

    #[allow(missing_docs)]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[allow(missing_docs)]
    pub fn document_type(&self) -> &str {
        &self.document_type
    }

    #[allow(missing_docs)]
    pub fn group(&self) -> Option<&Group> {
        self.group.as_ref()
    }

    #[allow(missing_docs)]
    pub fn user_specific(&self) -> &str {
        &self.user_specific
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id:{}:{}:", self.namespace, self.document_type)?;
        match &self.group {
            Some(Group::Number(number)) => write!(f, "n={number}")?,
            Some(Group::Name(group)) => write!(f, "g={group}")?,
            None => {}
        }
        write!(f, ":{}", self.user_specific)
    }
}

impl OperationType {
    /// The HTTP method used to send this kind of operation.
    pub fn method(self) -> Method {
        match self {
            OperationType::Put => Method::Post,
            OperationType::Update => Method::Put,
            OperationType::Remove => Method::Delete,
        }
    }
}

impl OperationParameters {
    #[allow(missing_docs)]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether an update should create the document if it does not exist.
    pub fn create_if_missing(self, create: bool) -> Self {
        Self {
            create_if_missing: create,
            ..self
        }
    }

    /// Only apply the operation if the stored document matches this selection.
    pub fn test_and_set_condition(self, condition: impl Into<String>) -> Self {
        let condition = condition.into();
        assert!(!condition.is_empty(), "condition must be non-empty");
        Self {
            test_and_set_condition: Some(condition),
            ..self
        }
    }

    /// Overall deadline for the operation, including retries.
    pub fn timeout(self, timeout: Duration) -> Self {
        assert!(timeout > Duration::ZERO, "timeout must be positive");
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    /// Route the operation through the given cluster route.
    pub fn route(self, route: impl Into<String>) -> Self {
        let route = route.into();
        assert!(!route.is_empty(), "route must be non-empty");
        Self {
            route: Some(route),
            ..self
        }
    }

    /// Server-side trace level, 1 to 9.
    pub fn trace_level(self, level: u8) -> Self {
        assert!((1..=9).contains(&level), "trace level must be in [1, 9]");
        Self {
            trace_level: Some(level),
            ..self
        }
    }

    #[allow(missing_docs)]
    pub fn creates_if_missing(&self) -> bool {
        self.create_if_missing
    }

    #[allow(missing_docs)]
    pub fn condition(&self) -> Option<&str> {
        self.test_and_set_condition.as_deref()
    }

    #[allow(missing_docs)]
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
    }

    #[allow(missing_docs)]
    pub fn route_name(&self) -> Option<&str> {
        self.route.as_deref()
    }

    #[allow(missing_docs)]
    pub fn trace(&self) -> Option<u8> {
        self.trace_level
    }
}

impl OperationResult {
    pub(crate) fn new(
        result_type: ResultType,
        document_id: DocumentId,
        message: Option<String>,
    ) -> Self {
        Self {
            result_type,
            document_id,
            message,
        }
    }

    pub(crate) fn failure(document_id: DocumentId, message: impl Into<String>) -> Self {
        Self::new(ResultType::Failure, document_id, Some(message.into()))
    }

    #[allow(missing_docs)]
    pub fn result_type(&self) -> ResultType {
        self.result_type
    }

    #[allow(missing_docs)]
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Response text from the cluster, or a description of the failure.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[allow(missing_docs)]
    pub fn is_success(&self) -> bool {
        self.result_type == ResultType::Success
    }
}

/// Build the request for an operation.
///
/// The path is `/document/v1/<namespace>/<type>/<docid|number/N|group/G>/<user-specific>`.
pub(crate) fn build_request(
    operation: OperationType,
    id: &DocumentId,
    body: Option<Bytes>,
    parameters: &OperationParameters,
    timeout: Duration,
) -> HttpRequest {
    let mut path = String::from("/document/v1/");
    encode_into(&mut path, &id.namespace);
    path.push('/');
    encode_into(&mut path, &id.document_type);
    match &id.group {
        Some(Group::Number(number)) => {
            let _ = write!(path, "/number/{number}/");
        }
        Some(Group::Name(group)) => {
            path.push_str("/group/");
            encode_into(&mut path, group);
            path.push('/');
        }
        None => path.push_str("/docid/"),
    }
    encode_into(&mut path, &id.user_specific);

    let mut query = Vec::new();
    if parameters.create_if_missing {
        query.push(("create", "true".to_owned()));
    }
    if let Some(condition) = &parameters.test_and_set_condition {
        query.push(("condition", condition.clone()));
    }
    query.push(("timeout", format!("{}ms", timeout.as_millis())));
    if let Some(route) = &parameters.route {
        query.push(("route", route.clone()));
    }
    if let Some(level) = parameters.trace_level {
        query.push(("tracelevel", level.to_string()));
    }
    for (i, (key, value)) in query.iter().enumerate() {
        path.push(if i == 0 { '?' } else { '&' });
        path.push_str(key);
        path.push('=');
        encode_into(&mut path, value);
    }

    let headers = if body.is_some() {
        vec![("Content-Type".to_owned(), "application/json".to_owned())]
    } else {
        Vec::new()
    };

    HttpRequest {
        method: operation.method(),
        path,
        headers,
        body,
    }
}

/// Percent-encode everything but RFC 3986 unreserved characters.
fn encode_into(out: &mut String, value: &str) {
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(char::from(byte))
            }
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
}
