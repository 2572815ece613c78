//! Typed RPC builders
//!
//! Client-side requests are built as passive values and serialized into
//! their canonical XML bodies when sent; the server side hands incoming
//! rpcs to the embedder as raw element trees, since operation semantics
//! (locking, editing, committing) belong to the application.

use crate::xml::{Element, Node};

/// Namespace of the ietf-netconf-monitoring get-schema operation.
pub const MONITORING_NS: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring";

/// A configuration datastore addressed by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datastore {
    Running,
    Candidate,
    Startup,
}

impl Datastore {
    fn element(&self) -> Element {
        Element::new(match self {
            Datastore::Running => "running",
            Datastore::Candidate => "candidate",
            Datastore::Startup => "startup",
        })
    }
}

/// Source of a copy-config or validate.
#[derive(Debug, Clone)]
pub enum Source {
    Datastore(Datastore),
    Url(String),
    /// Inline `<config>` subtree.
    Config(Element),
}

impl Source {
    fn element(&self) -> Element {
        match self {
            Source::Datastore(ds) => ds.element(),
            Source::Url(url) => Element::new("url").with_text(url),
            Source::Config(config) => Element::new("config").with_child(config.clone()),
        }
    }
}

/// Target of a copy-config.
#[derive(Debug, Clone)]
pub enum Target {
    Datastore(Datastore),
    Url(String),
}

impl Target {
    fn element(&self) -> Element {
        match self {
            Target::Datastore(ds) => ds.element(),
            Target::Url(url) => Element::new("url").with_text(url),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultOperation {
    Merge,
    Replace,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOption {
    TestThenSet,
    Set,
    TestOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOption {
    StopOnError,
    ContinueOnError,
    RollbackOnError,
}

/// One NETCONF request, ready to be enveloped and framed.
#[derive(Debug, Clone)]
pub enum Rpc {
    /// Arbitrary caller-built operation element.
    Generic(Element),
    GetConfig {
        source: Datastore,
        filter: Option<Element>,
    },
    EditConfig {
        target: Datastore,
        default_operation: Option<DefaultOperation>,
        test_option: Option<TestOption>,
        error_option: Option<ErrorOption>,
        config: Element,
    },
    CopyConfig {
        source: Source,
        target: Target,
    },
    DeleteConfig {
        target: Datastore,
    },
    Lock {
        target: Datastore,
    },
    Unlock {
        target: Datastore,
    },
    Get {
        filter: Option<Element>,
    },
    KillSession {
        session_id: u32,
    },
    Commit {
        confirmed: bool,
        confirm_timeout: Option<u32>,
        persist: Option<String>,
        persist_id: Option<String>,
    },
    DiscardChanges,
    CancelCommit {
        persist_id: Option<String>,
    },
    Validate {
        source: Source,
    },
    GetSchema {
        identifier: String,
        version: Option<String>,
        format: Option<String>,
    },
    CreateSubscription {
        stream: Option<String>,
        filter: Option<Element>,
        start_time: Option<String>,
        stop_time: Option<String>,
    },
    CloseSession,
}

impl Rpc {
    /// The operation's element name, mostly for logging.
    pub fn op_name(&self) -> &'static str {
        match self {
            Rpc::Generic(_) => "generic",
            Rpc::GetConfig { .. } => "get-config",
            Rpc::EditConfig { .. } => "edit-config",
            Rpc::CopyConfig { .. } => "copy-config",
            Rpc::DeleteConfig { .. } => "delete-config",
            Rpc::Lock { .. } => "lock",
            Rpc::Unlock { .. } => "unlock",
            Rpc::Get { .. } => "get",
            Rpc::KillSession { .. } => "kill-session",
            Rpc::Commit { .. } => "commit",
            Rpc::DiscardChanges => "discard-changes",
            Rpc::CancelCommit { .. } => "cancel-commit",
            Rpc::Validate { .. } => "validate",
            Rpc::GetSchema { .. } => "get-schema",
            Rpc::CreateSubscription { .. } => "create-subscription",
            Rpc::CloseSession => "close-session",
        }
    }

    /// Render the operation body (the child of `<rpc>`).
    pub fn to_element(&self) -> Element {
        match self {
            Rpc::Generic(elem) => elem.clone(),
            Rpc::GetConfig { source, filter } => {
                let mut op = Element::new("get-config")
                    .with_child(Element::new("source").with_child(source.element()));
                if let Some(f) = filter {
                    op = op.with_child(f.clone());
                }
                op
            }
            Rpc::EditConfig {
                target,
                default_operation,
                test_option,
                error_option,
                config,
            } => {
                let mut op = Element::new("edit-config")
                    .with_child(Element::new("target").with_child(target.element()));
                if let Some(d) = default_operation {
                    let v = match d {
                        DefaultOperation::Merge => "merge",
                        DefaultOperation::Replace => "replace",
                        DefaultOperation::None => "none",
                    };
                    op = op.with_child(Element::new("default-operation").with_text(v));
                }
                if let Some(t) = test_option {
                    let v = match t {
                        TestOption::TestThenSet => "test-then-set",
                        TestOption::Set => "set",
                        TestOption::TestOnly => "test-only",
                    };
                    op = op.with_child(Element::new("test-option").with_text(v));
                }
                if let Some(e) = error_option {
                    let v = match e {
                        ErrorOption::StopOnError => "stop-on-error",
                        ErrorOption::ContinueOnError => "continue-on-error",
                        ErrorOption::RollbackOnError => "rollback-on-error",
                    };
                    op = op.with_child(Element::new("error-option").with_text(v));
                }
                op.with_child(Element::new("config").with_child(config.clone()))
            }
            Rpc::CopyConfig { source, target } => Element::new("copy-config")
                .with_child(Element::new("target").with_child(target.element()))
                .with_child(Element::new("source").with_child(source.element())),
            Rpc::DeleteConfig { target } => Element::new("delete-config")
                .with_child(Element::new("target").with_child(target.element())),
            Rpc::Lock { target } => Element::new("lock")
                .with_child(Element::new("target").with_child(target.element())),
            Rpc::Unlock { target } => Element::new("unlock")
                .with_child(Element::new("target").with_child(target.element())),
            Rpc::Get { filter } => {
                let mut op = Element::new("get");
                if let Some(f) = filter {
                    op = op.with_child(f.clone());
                }
                op
            }
            Rpc::KillSession { session_id } => Element::new("kill-session")
                .with_child(Element::new("session-id").with_text(&session_id.to_string())),
            Rpc::Commit {
                confirmed,
                confirm_timeout,
                persist,
                persist_id,
            } => {
                let mut op = Element::new("commit");
                if *confirmed {
                    op = op.with_child(Element::new("confirmed"));
                    if let Some(t) = confirm_timeout {
                        op = op
                            .with_child(Element::new("confirm-timeout").with_text(&t.to_string()));
                    }
                    if let Some(p) = persist {
                        op = op.with_child(Element::new("persist").with_text(p));
                    }
                }
                if let Some(p) = persist_id {
                    op = op.with_child(Element::new("persist-id").with_text(p));
                }
                op
            }
            Rpc::DiscardChanges => Element::new("discard-changes"),
            Rpc::CancelCommit { persist_id } => {
                let mut op = Element::new("cancel-commit");
                if let Some(p) = persist_id {
                    op = op.with_child(Element::new("persist-id").with_text(p));
                }
                op
            }
            Rpc::Validate { source } => Element::new("validate")
                .with_child(Element::new("source").with_child(source.element())),
            Rpc::GetSchema {
                identifier,
                version,
                format,
            } => {
                let mut op = Element::new("get-schema")
                    .with_ns(MONITORING_NS)
                    .with_child(Element::new("identifier").with_text(identifier));
                if let Some(v) = version {
                    op = op.with_child(Element::new("version").with_text(v));
                }
                if let Some(f) = format {
                    op = op.with_child(Element::new("format").with_text(f));
                }
                op
            }
            Rpc::CreateSubscription {
                stream,
                filter,
                start_time,
                stop_time,
            } => {
                let mut op =
                    Element::new("create-subscription").with_ns(crate::message::NOTIF_NS);
                if let Some(s) = stream {
                    op = op.with_child(Element::new("stream").with_text(s));
                }
                if let Some(f) = filter {
                    op = op.with_child(f.clone());
                }
                if let Some(t) = start_time {
                    op = op.with_child(Element::new("startTime").with_text(t));
                }
                if let Some(t) = stop_time {
                    op = op.with_child(Element::new("stopTime").with_text(t));
                }
                op
            }
            Rpc::CloseSession => Element::new("close-session"),
        }
    }
}

/// Severity carried by an `<rpc-error>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Error,
    Warning,
}

/// An `<rpc-error>` body a server handler can return.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub error_type: String,
    pub tag: String,
    pub severity: ErrorSeverity,
    pub app_tag: Option<String>,
    pub path: Option<String>,
    pub message: Option<String>,
}

impl RpcError {
    pub fn new(error_type: &str, tag: &str, message: Option<&str>) -> RpcError {
        RpcError {
            error_type: error_type.to_string(),
            tag: tag.to_string(),
            severity: ErrorSeverity::Error,
            app_tag: None,
            path: None,
            message: message.map(|m| m.to_string()),
        }
    }

    fn to_element(&self) -> Element {
        let mut err = Element::new("rpc-error")
            .with_child(Element::new("error-type").with_text(&self.error_type))
            .with_child(Element::new("error-tag").with_text(&self.tag))
            .with_child(Element::new("error-severity").with_text(match self.severity {
                ErrorSeverity::Error => "error",
                ErrorSeverity::Warning => "warning",
            }));
        if let Some(t) = &self.app_tag {
            err = err.with_child(Element::new("error-app-tag").with_text(t));
        }
        if let Some(p) = &self.path {
            err = err.with_child(Element::new("error-path").with_text(p));
        }
        if let Some(m) = &self.message {
            err = err.with_child(Element::new("error-message").with_text(m));
        }
        err
    }
}

/// Content of an outgoing `<rpc-reply>`.
#[derive(Debug, Clone)]
pub enum Reply {
    /// `<ok/>`
    Ok,
    /// Result wrapped in `<data>`.
    Data(Element),
    /// One or more `<rpc-error>`s.
    Errors(Vec<RpcError>),
    /// Caller-rendered reply children.
    Raw(Vec<Node>),
}

impl Reply {
    /// Render the reply's child nodes.
    pub fn into_content(self) -> Vec<Node> {
        match self {
            Reply::Ok => vec![Node::Element(Element::new("ok"))],
            Reply::Data(data) => {
                vec![Node::Element(Element::new("data").with_child(data))]
            }
            Reply::Errors(errors) => errors
                .into_iter()
                .map(|e| Node::Element(e.to_element()))
                .collect(),
            Reply::Raw(nodes) => nodes,
        }
    }
}

/// True when a parsed `<rpc-reply>` is a bare `<ok/>`.
pub fn reply_is_ok(reply: &Element) -> bool {
    reply.child("ok").is_some()
}

/// The `<data>` subtree of a parsed `<rpc-reply>`, if any.
pub fn reply_data(reply: &Element) -> Option<&Element> {
    reply.child("data")
}

/// The `<rpc-error>`s of a parsed `<rpc-reply>`.
pub fn reply_errors(reply: &Element) -> Vec<&Element> {
    reply.children_named("rpc-error").collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_body() {
        let body = Rpc::Lock {
            target: Datastore::Running,
        }
        .to_element();
        assert_eq!(body.to_xml(), "<lock><target><running/></target></lock>");
    }

    #[test]
    fn get_config_with_filter() {
        let filter = Element::new("filter")
            .with_attr("type", "subtree")
            .with_child(Element::new("interfaces"));
        let body = Rpc::GetConfig {
            source: Datastore::Candidate,
            filter: Some(filter),
        }
        .to_element();
        assert_eq!(
            body.to_xml(),
            r#"<get-config><source><candidate/></source><filter type="subtree"><interfaces/></filter></get-config>"#
        );
    }

    #[test]
    fn edit_config_options_in_order() {
        let body = Rpc::EditConfig {
            target: Datastore::Candidate,
            default_operation: Some(DefaultOperation::Merge),
            test_option: None,
            error_option: Some(ErrorOption::RollbackOnError),
            config: Element::new("top"),
        }
        .to_element();
        assert_eq!(
            body.to_xml(),
            "<edit-config><target><candidate/></target><default-operation>merge</default-operation><error-option>rollback-on-error</error-option><config><top/></config></edit-config>"
        );
    }

    #[test]
    fn kill_session_body() {
        let body = Rpc::KillSession { session_id: 42 }.to_element();
        assert_eq!(
            body.to_xml(),
            "<kill-session><session-id>42</session-id></kill-session>"
        );
    }

    #[test]
    fn error_reply_content() {
        let content = Reply::Errors(vec![RpcError::new(
            "protocol",
            "operation-not-supported",
            Some("no handler"),
        )])
        .into_content();
        let reply = crate::message::build_reply("9", content);
        let xml = reply.to_xml();
        assert!(xml.contains("<error-tag>operation-not-supported</error-tag>"));
        assert!(xml.contains("<error-severity>error</error-severity>"));
        assert!(xml.contains("<error-message>no handler</error-message>"));
    }

    #[test]
    fn get_schema_uses_monitoring_namespace() {
        let body = Rpc::GetSchema {
            identifier: "ietf-interfaces".into(),
            version: None,
            format: Some("yang".into()),
        }
        .to_element();
        assert!(body.to_xml().starts_with(
            r#"<get-schema xmlns="urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring">"#
        ));
    }
}
