use strata_core::{CoreError, ErrorCategory, codes};
use thiserror::Error;

use crate::ChannelShape;

/// 绑定构建期错误。
///
/// 全部属于配置类错误：在构建时同步暴露，不应重试。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("no channel builder is available for `{shape}`: the binding has no remaining elements")]
    NoChannelBuilder { shape: ChannelShape },
    #[error("binding elements were not consumed during build: {elements}")]
    UnconsumedElements { elements: String },
    #[error("binding element `{element}` cannot build a `{shape}` channel {role}")]
    UnsupportedShape {
        element: String,
        shape: ChannelShape,
        role: &'static str,
    },
    #[error("binding element `{element}` requires the `{parameter}` binding parameter")]
    MissingParameter {
        element: String,
        parameter: &'static str,
    },
}

impl BindingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoChannelBuilder { .. } => codes::BINDING_NO_CHANNEL_BUILDER,
            Self::UnconsumedElements { .. } => codes::BINDING_UNCONSUMED_ELEMENTS,
            Self::UnsupportedShape { .. } => codes::BINDING_UNSUPPORTED_SHAPE,
            Self::MissingParameter { .. } => codes::BINDING_MISSING_PARAMETER,
        }
    }
}

impl From<BindingError> for CoreError {
    fn from(err: BindingError) -> Self {
        CoreError::new(err.code(), err.to_string()).with_category(ErrorCategory::Configuration)
    }
}
