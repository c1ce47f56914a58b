use std::fmt;

/// 通道形态。
///
/// # 设计背景（Why）
/// - 绑定在构建时需要知道调用方想要哪一种通道：单向发送、单向接收、双工、请求/应答，
///   以及它们的会话变体。以枚举表达形态，绑定元素即可在运行时判断是否支持，
///   而无需为每种形态定义一套泛型工厂。
///
/// # 契约说明（What）
/// - [`can_send`](Self::can_send)/[`can_receive`](Self::can_receive) 决定通道应暴露
///   [`MessageSink`](crate::MessageSink) 还是 [`MessageSource`](crate::MessageSource)；
/// - 会话形态与对应的非会话形态收发能力一致。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelShape {
    Output,
    Input,
    Duplex,
    Request,
    Reply,
    OutputSession,
    InputSession,
    DuplexSession,
}

impl ChannelShape {
    pub const ALL: [ChannelShape; 8] = [
        Self::Output,
        Self::Input,
        Self::Duplex,
        Self::Request,
        Self::Reply,
        Self::OutputSession,
        Self::InputSession,
        Self::DuplexSession,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Input => "input",
            Self::Duplex => "duplex",
            Self::Request => "request",
            Self::Reply => "reply",
            Self::OutputSession => "output-session",
            Self::InputSession => "input-session",
            Self::DuplexSession => "duplex-session",
        }
    }

    pub fn is_sessionful(self) -> bool {
        matches!(
            self,
            Self::OutputSession | Self::InputSession | Self::DuplexSession
        )
    }

    pub fn can_send(self) -> bool {
        matches!(
            self,
            Self::Output | Self::Duplex | Self::Request | Self::OutputSession | Self::DuplexSession
        )
    }

    pub fn can_receive(self) -> bool {
        matches!(
            self,
            Self::Input | Self::Duplex | Self::Reply | Self::InputSession | Self::DuplexSession
        )
    }

    /// 去掉会话语义后的形态。
    pub fn without_session(self) -> Self {
        match self {
            Self::OutputSession => Self::Output,
            Self::InputSession => Self::Input,
            Self::DuplexSession => Self::Duplex,
            other => other,
        }
    }
}

impl fmt::Display for ChannelShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
