use std::{fmt, sync::Arc};

use strata_core::{CoreError, Result, codes};

/// 端点地址：`scheme://host[:port][/path]`。
///
/// # 教案级说明
///
/// ## 意图（Why）
/// - 通道工厂以地址建立通道，连接池以地址派生池键；两者都只需要协议、主机、端口与路径，
///   不需要完整的 URI 语义（查询串、用户信息等）。
///
/// ## 契约（What）
/// - 协议与主机名统一转为小写，路径保留原样，缺省为 `/`；
/// - IPv6 主机使用方括号书写，[`host`](Self::host) 返回不含方括号的形式；
/// - 克隆廉价，原始文本以 `Arc<str>` 共享。
///
/// ## 风险提示（Trade-offs）
/// - 不做百分号解码，也不解析查询串；包含 `?`/`#` 的地址会被原样并入路径。
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    uri: Arc<str>,
    scheme: Arc<str>,
    host: Arc<str>,
    port: Option<u16>,
    path: Arc<str>,
}

fn invalid(uri: &str, reason: &str) -> CoreError {
    CoreError::new(
        codes::TRANSPORT_ADDRESS,
        format!("invalid endpoint address `{uri}`: {reason}"),
    )
}

impl EndpointAddress {
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid(uri, "missing `://`"))?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(invalid(uri, "malformed scheme"));
        }

        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, "/"),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid(uri, "unterminated IPv6 literal"))?;
            let port = match tail {
                "" => None,
                tail => Some(
                    tail.strip_prefix(':')
                        .ok_or_else(|| invalid(uri, "unexpected text after IPv6 literal"))?,
                ),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid(uri, "missing host"));
        }
        let port = port
            .map(|port| port.parse::<u16>().map_err(|_| invalid(uri, "port out of range")))
            .transpose()?;

        let scheme = scheme.to_ascii_lowercase();
        let host = host.to_ascii_lowercase();
        let normalized = match port {
            Some(port) if host.contains(':') => format!("{scheme}://[{host}]:{port}{path}"),
            Some(port) => format!("{scheme}://{host}:{port}{path}"),
            None if host.contains(':') => format!("{scheme}://[{host}]{path}"),
            None => format!("{scheme}://{host}{path}"),
        };

        Ok(Self {
            uri: normalized.into(),
            scheme: scheme.into(),
            host: host.into(),
            port,
            path: path.into(),
        })
    }

    /// 规范化后的完整地址。
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port` 形式，缺省端口以 `default_port` 补齐；用于建连与池键。
    pub fn authority(&self, default_port: u16) -> String {
        let port = self.port.unwrap_or(default_port);
        if self.host.contains(':') {
            format!("[{}]:{port}", self.host)
        } else {
            format!("{}:{port}", self.host)
        }
    }

    /// 以当前地址为基准拼接相对路径。
    pub fn join(&self, relative: &str) -> Result<Self> {
        if relative.is_empty() {
            return Ok(self.clone());
        }
        let base = self.uri.trim_end_matches('/');
        let relative = relative.trim_start_matches('/');
        Self::parse(&format!("{base}/{relative}"))
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

impl fmt::Debug for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EndpointAddress").field(&self.uri).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes() {
        let address = EndpointAddress::parse("TCP://Example.COM:8080/svc/echo").expect("地址应合法");
        assert_eq!(address.scheme(), "tcp");
        assert_eq!(address.host(), "example.com");
        assert_eq!(address.port(), Some(8080));
        assert_eq!(address.path(), "/svc/echo");
        assert_eq!(address.uri(), "tcp://example.com:8080/svc/echo");
        assert_eq!(address.authority(808), "example.com:8080");
    }

    #[test]
    fn ipv6_literal_keeps_brackets_in_authority() {
        let address = EndpointAddress::parse("tcp://[::1]:9000").expect("地址应合法");
        assert_eq!(address.host(), "::1");
        assert_eq!(address.path(), "/");
        assert_eq!(address.authority(0), "[::1]:9000");
    }

    #[test]
    fn rejects_malformed_input() {
        for uri in ["no-scheme", "tcp://", "tcp://host:99999", "tcp://[::1"] {
            let err = EndpointAddress::parse(uri).expect_err(uri);
            assert_eq!(err.code(), codes::TRANSPORT_ADDRESS);
        }
    }

    #[test]
    fn join_appends_relative_path() {
        let base = EndpointAddress::parse("mem://node/base/").expect("地址应合法");
        let joined = base.join("/inbox").expect("拼接应成功");
        assert_eq!(joined.uri(), "mem://node/base/inbox");
    }
}
