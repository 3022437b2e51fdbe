//! Classification of inbound smart-HTTP requests.

use axum::http::Method;

use crate::error::ProxyError;
use crate::metrics::CommandType;

const INFO_REFS: &str = "/info/refs";
const UPLOAD_PACK: &str = "/git-upload-pack";
const RECEIVE_PACK: &str = "/git-receive-pack";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    UploadPack,
    ReceivePack,
}

impl GitService {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }
}

/// One recognised protocol exchange.  `repo` is the raw path in front of the
/// protocol suffix, still to be canonicalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolRequest {
    InfoRefs { repo: String, service: GitService },
    UploadPack { repo: String },
    ReceivePack { repo: String },
}

impl ProtocolRequest {
    pub fn classify(method: &Method, path: &str, query: Option<&str>) -> Result<Self, ProxyError> {
        if let Some(repo) = path.strip_suffix(INFO_REFS) {
            if method != Method::GET {
                return Err(ProxyError::MethodNotAllowed);
            }
            let service = service_param(query)
                .ok_or_else(|| ProxyError::BadRequest("missing service parameter".into()))?;
            let service = GitService::from_name(&service)
                .ok_or_else(|| ProxyError::BadRequest(format!("unsupported service {service:?}")))?;
            return Ok(Self::InfoRefs {
                repo: repo.to_string(),
                service,
            });
        }

        if let Some(repo) = path.strip_suffix(UPLOAD_PACK) {
            if method != Method::POST {
                return Err(ProxyError::MethodNotAllowed);
            }
            return Ok(Self::UploadPack {
                repo: repo.to_string(),
            });
        }

        if let Some(repo) = path.strip_suffix(RECEIVE_PACK) {
            if method != Method::POST {
                return Err(ProxyError::MethodNotAllowed);
            }
            return Ok(Self::ReceivePack {
                repo: repo.to_string(),
            });
        }

        Err(ProxyError::NotFound)
    }

    pub fn repo_path(&self) -> &str {
        match self {
            Self::InfoRefs { repo, .. } | Self::UploadPack { repo } | Self::ReceivePack { repo } => {
                repo
            }
        }
    }

    pub fn command_type(&self) -> CommandType {
        match self {
            Self::InfoRefs { .. } => CommandType::InfoRefs,
            Self::UploadPack { .. } => CommandType::UploadPack,
            Self::ReceivePack { .. } => CommandType::ReceivePack,
        }
    }
}

fn service_param(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "service")
        .map(|(_, value)| value.into_owned())
}
