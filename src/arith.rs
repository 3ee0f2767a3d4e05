//! Built-in arithmetic service used by the `corerpc` binary

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::network::{RpcService, ServiceBuilder};

/// Operands of every `Arith` method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Args {
    pub a: i64,
    pub b: i64,
}

impl Args {
    pub fn new(a: i64, b: i64) -> Self {
        Self { a, b }
    }
}

/// Service answering `Arith.Sum`, `Arith.Mul` and `Arith.Div`
#[derive(Debug, Default)]
pub struct Arith;

impl Arith {
    pub async fn sum(self: Arc<Self>, args: Args) -> Result<i64, String> {
        args.a
            .checked_add(args.b)
            .ok_or_else(|| "integer overflow".to_string())
    }

    pub async fn mul(self: Arc<Self>, args: Args) -> Result<i64, String> {
        args.a
            .checked_mul(args.b)
            .ok_or_else(|| "integer overflow".to_string())
    }

    pub async fn div(self: Arc<Self>, args: Args) -> Result<i64, String> {
        if args.b == 0 {
            return Err("divide by zero".to_string());
        }
        args.a
            .checked_div(args.b)
            .ok_or_else(|| "integer overflow".to_string())
    }
}

impl RpcService for Arith {
    fn register_methods(builder: ServiceBuilder<Self>) -> ServiceBuilder<Self> {
        builder
            .method("Sum", Arith::sum)
            .method("Mul", Arith::mul)
            .method("Div", Arith::div)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecType;
    use crate::error::RpcError;
    use crate::network::{Client, Server};
    use crate::protocol::HandshakeOption;

    async fn connect(codec: CodecType) -> Client {
        let server = Server::default();
        server.register(Arith).unwrap();

        let (client_end, server_end) = tokio::io::duplex(4096);
        tokio::spawn(async move { server.serve_conn(server_end).await });

        Client::new(client_end, HandshakeOption::new().with_codec_type(codec))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_arith_over_both_codecs() {
        for codec in [CodecType::Bincode, CodecType::Json] {
            let client = connect(codec).await;
            assert_eq!(client.codec(), codec);

            let sum: i64 = client.call("Arith.Sum", Args::new(2, 3)).await.unwrap();
            assert_eq!(sum, 5);
            let product: i64 = client.call("Arith.Mul", Args::new(-4, 6)).await.unwrap();
            assert_eq!(product, -24);
            let quotient: i64 = client.call("Arith.Div", Args::new(17, 5)).await.unwrap();
            assert_eq!(quotient, 3);
        }
    }

    #[tokio::test]
    async fn test_divide_by_zero() {
        let client = connect(CodecType::Bincode).await;
        let err = client
            .call::<_, i64>("Arith.Div", Args::new(1, 0))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Remote("divide by zero".to_string()));

        let sum: i64 = client.call("Arith.Sum", Args::new(1, 1)).await.unwrap();
        assert_eq!(sum, 2);
    }

    #[test]
    fn test_registered_methods() {
        let service = Arith::register_methods(ServiceBuilder::new(Arith)).build();
        assert_eq!(service.name(), "Arith");

        let mut names: Vec<&str> = service.method_names().collect();
        names.sort_unstable();
        assert_eq!(names, ["Div", "Mul", "Sum"]);
    }
}
