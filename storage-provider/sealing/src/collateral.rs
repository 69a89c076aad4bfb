use crate::{
    chain::{ChainApi, ChainApiError, TipSetKey},
    config::{CollateralConfig, FeeConfig},
    message::{methods, MethodNum},
    types::{Address, TokenAmount},
};

/// Collateral left to attach to a message after the miner's available balance has been used.
///
/// The buffer is kept aside from the available balance, both differences clamp at zero.
pub fn net_collateral(
    collateral: TokenAmount,
    available: TokenAmount,
    buffer: &TokenAmount,
) -> TokenAmount {
    let available = (available - buffer).clamp_zero();
    (collateral - available).clamp_zero()
}

/// Computes the value to send along with a message requiring `collateral`.
///
/// Queries the miner's available balance when collateral is taken from it; a failed query is
/// returned as is.
#[tracing::instrument(skip_all, fields(miner = %miner, collateral = %collateral))]
pub async fn collateral_send_amount(
    chain: &dyn ChainApi,
    config: &CollateralConfig,
    miner: Address,
    tipset: &TipSetKey,
    collateral: TokenAmount,
) -> Result<TokenAmount, ChainApiError> {
    if !config.from_miner_balance {
        return Ok(collateral);
    }

    if config.disable_fallback {
        return Ok(TokenAmount::zero());
    }

    let available = chain.miner_available_balance(miner, tipset).await?;
    let amount = net_collateral(collateral, available, &config.available_balance_buffer);
    tracing::debug!(%amount, "collateral to send");

    Ok(amount)
}

/// Fee ceiling for a message calling `method`.
pub fn max_fee(fees: &FeeConfig, method: MethodNum) -> TokenAmount {
    match method {
        methods::PRE_COMMIT_SECTOR => fees.max_pre_commit_fee.clone(),
        methods::PROVE_COMMIT_SECTOR => fees.max_commit_fee.clone(),
        methods::DECLARE_FAULTS => fees.max_declare_faults_fee.clone(),
        _ => TokenAmount::zero(),
    }
}
