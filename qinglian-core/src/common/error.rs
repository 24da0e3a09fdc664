use std::{error::Error as StdError, fmt};

pub type Result<T> = std::result::Result<T, Error>;
type Cause = Box<dyn StdError + Send + Sync>;

pub struct Error {
    inner: Box<ErrorImpl>,
    description: Option<String>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug, Clone, Copy)]
pub enum Kind {
    General,

    /// Indicates that a wrong dynamic type was passed for a node field
    InvalidField,

    /// Indicates a mutation arrived after the state machine was stopped
    AfterStop,

    /// Indicates that a flag or field was registered after start
    Setup,

    /// Indicates that a persisted record could not be decoded
    Decode,

    /// 持久化后端（kv 存储）读写失败
    Kv,

    IO,

    /// Indicates that an internal channel was closed
    ChannelClosed,
}

impl Error {
    pub fn new(kind: Kind, description: Option<String>, cause: Option<Cause>) -> Self {
        Self {
            description,
            inner: Box::new(ErrorImpl { kind, cause }),
        }
    }

    pub fn new_general(description: &str) -> Self {
        Error::new(Kind::General, Some(description.to_owned()), None)
    }

    pub fn new_invalid_field(description: &str) -> Self {
        Error::new(Kind::InvalidField, Some(description.to_owned()), None)
    }

    pub fn new_after_stop(description: &str) -> Self {
        Error::new(Kind::AfterStop, Some(description.to_owned()), None)
    }

    pub fn new_setup(description: &str) -> Self {
        Error::new(Kind::Setup, Some(description.to_owned()), None)
    }

    pub fn new_decode(description: &str) -> Self {
        Error::new(Kind::Decode, Some(description.to_owned()), None)
    }

    pub fn new_kv(cause: Option<Cause>, description: Option<String>) -> Self {
        Error::new(Kind::Kv, description, cause)
    }

    pub fn new_io(cause: Option<Cause>) -> Self {
        Error::new(Kind::IO, None, cause)
    }

    pub fn new_channel_closed(description: &str) -> Self {
        Error::new(Kind::ChannelClosed, Some(description.to_owned()), None)
    }

    pub fn is_invalid_field(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidField)
    }

    pub fn is_after_stop(&self) -> bool {
        matches!(self.inner.kind, Kind::AfterStop)
    }

    pub fn get_kind(&self) -> Kind {
        self.inner.kind
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("qinglian_core::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        if let Some(ref description) = self.description {
            f.field(description);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(description) = &self.description {
            f.write_str(description)?
        } else {
            f.write_str(&format!("{:?}", self.inner.kind))?
        }

        if let Some(ref cause) = self.inner.cause {
            f.write_str(&format!(": {}", cause))?
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}
