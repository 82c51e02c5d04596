use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] jsonrpsee::core::ClientError),

    #[error("invalid rpc credentials: {0}")]
    InvalidCredentials(String),

    #[error("transaction input {vout} not present in funding transaction {txid}")]
    MissingOutput { txid: bitcoin::Txid, vout: u32 },
}
