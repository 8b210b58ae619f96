//! Decoder registry: maps subscription decoder keys to typed log decoders.
//!
//! Each [`ContractSubscription`](crate::config::SubscriptionSeed) names a
//! `decoder_key`; the registry resolves the key to the topic0 filter list
//! for the log query and to a decode function producing a normalized
//! [`DecodedEvent`].
//!
//! Decoders are pure, total functions: well-formed ABI data always decodes,
//! and malformed data is reported through a [`LedgerError::DecodingError`]
//! result, never by aborting. The indexer skips the individual record and
//! still advances its checkpoint.

use std::collections::HashMap;

use alloy::primitives::{Address, LogData, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;

use crate::error::{LedgerError, LedgerResult};

use super::{BridgeDirection, DecodedEvent, GardenVersion, IBridge, ICombat, IERC20,
    IMasterGardener, IQuestCore};

type DecodeFn = fn(&Log) -> LedgerResult<DecodedEvent>;

struct DecoderSpec {
    topics: Vec<B256>,
    decode: DecodeFn,
}

/// Registry resolving `(decoder_key, topic0)` to a typed decoder.
pub struct DecoderRegistry {
    specs: HashMap<&'static str, DecoderSpec>,
}

impl DecoderRegistry {
    /// Build the registry with the full decoder set.
    #[must_use]
    pub fn new() -> Self {
        let mut specs: HashMap<&'static str, DecoderSpec> = HashMap::new();

        specs.insert(
            "erc20_transfer",
            DecoderSpec {
                topics: vec![IERC20::Transfer::SIGNATURE_HASH],
                decode: decode_erc20_transfer,
            },
        );
        specs.insert(
            "jeweler_staking",
            DecoderSpec {
                topics: vec![IERC20::Transfer::SIGNATURE_HASH],
                decode: decode_jeweler,
            },
        );
        specs.insert(
            "pool_staking_v1",
            DecoderSpec {
                topics: gardener_topics(),
                decode: decode_pool_v1,
            },
        );
        specs.insert(
            "pool_staking_v2",
            DecoderSpec {
                topics: gardener_topics(),
                decode: decode_pool_v2,
            },
        );
        specs.insert(
            "quest_rewards",
            DecoderSpec {
                topics: vec![IQuestCore::QuestReward::SIGNATURE_HASH],
                decode: decode_quest_reward,
            },
        );
        specs.insert(
            "combat",
            DecoderSpec {
                topics: vec![
                    ICombat::EncounterResolved::SIGNATURE_HASH,
                    ICombat::LootDropped::SIGNATURE_HASH,
                ],
                decode: decode_combat,
            },
        );
        specs.insert(
            "bridge",
            DecoderSpec {
                topics: vec![
                    IBridge::TokenDeposit::SIGNATURE_HASH,
                    IBridge::TokenWithdraw::SIGNATURE_HASH,
                ],
                decode: decode_bridge,
            },
        );

        Self { specs }
    }

    /// The topic0 filter list for a decoder key.
    #[must_use]
    pub fn topics(&self, key: &str) -> Option<&[B256]> {
        self.specs.get(key).map(|s| s.topics.as_slice())
    }

    /// Decode a log through the named decoder.
    ///
    /// # Errors
    ///
    /// - Unknown decoder key (configuration bug, permanent)
    /// - Malformed payload (the record is skipped by the caller)
    pub fn decode(&self, key: &str, log: &Log) -> LedgerResult<DecodedEvent> {
        let spec = self
            .specs
            .get(key)
            .ok_or_else(|| LedgerError::config(format!("unknown decoder key: {key}"), None))?;
        (spec.decode)(log)
    }

    /// All registered decoder keys.
    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.specs.keys().copied()
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn gardener_topics() -> Vec<B256> {
    vec![
        IMasterGardener::Deposit::SIGNATURE_HASH,
        IMasterGardener::Withdraw::SIGNATURE_HASH,
        IMasterGardener::SendGovernanceTokenReward::SIGNATURE_HASH,
    ]
}

/// Rebuild the primitive log payload alloy's decoders consume.
fn log_payload(log: &Log) -> LogData {
    LogData::new_unchecked(log.topics().to_vec(), log.data().data.clone())
}

fn topic0(log: &Log) -> LedgerResult<B256> {
    log.topic0()
        .copied()
        .ok_or_else(|| LedgerError::decoding("log has no topics", None))
}

fn pool_id_from(pid: U256) -> LedgerResult<u64> {
    u64::try_from(pid)
        .map_err(|e| LedgerError::decoding(format!("pool id out of range: {pid}"), Some(Box::new(e))))
}

fn decode_err(event: &str, e: impl std::error::Error + Send + Sync + 'static) -> LedgerError {
    LedgerError::decoding(format!("malformed {event} payload"), Some(Box::new(e)))
}

fn decode_erc20_transfer(log: &Log) -> LedgerResult<DecodedEvent> {
    let data = log_payload(log);
    let ev = IERC20::Transfer::decode_log_data(&data, true)
        .map_err(|e| decode_err("Transfer", e))?;
    Ok(DecodedEvent::Erc20Transfer {
        token: log.address(),
        from: ev.from,
        to: ev.to,
        amount: ev.value,
    })
}

/// cJEWEL transfers: mint/burn are derived from the zero address.
fn decode_jeweler(log: &Log) -> LedgerResult<DecodedEvent> {
    let data = log_payload(log);
    let ev = IERC20::Transfer::decode_log_data(&data, true)
        .map_err(|e| decode_err("Transfer", e))?;

    if ev.from == Address::ZERO {
        return Ok(DecodedEvent::JewelerMint {
            wallet: ev.to,
            amount: ev.value,
        });
    }
    if ev.to == Address::ZERO {
        return Ok(DecodedEvent::JewelerBurn {
            wallet: ev.from,
            amount: ev.value,
        });
    }
    // Position moved between wallets; surfaces on the transfer stream.
    Ok(DecodedEvent::Erc20Transfer {
        token: log.address(),
        from: ev.from,
        to: ev.to,
        amount: ev.value,
    })
}

fn decode_pool_v1(log: &Log) -> LedgerResult<DecodedEvent> {
    decode_pool(log, GardenVersion::V1)
}

fn decode_pool_v2(log: &Log) -> LedgerResult<DecodedEvent> {
    decode_pool(log, GardenVersion::V2)
}

fn decode_pool(log: &Log, version: GardenVersion) -> LedgerResult<DecodedEvent> {
    let data = log_payload(log);
    let topic = topic0(log)?;

    if topic == IMasterGardener::Deposit::SIGNATURE_HASH {
        let ev = IMasterGardener::Deposit::decode_log_data(&data, true)
            .map_err(|e| decode_err("Deposit", e))?;
        return Ok(DecodedEvent::PoolDeposit {
            version,
            pool_id: pool_id_from(ev.pid)?,
            wallet: ev.user,
            amount: ev.amount,
        });
    }
    if topic == IMasterGardener::Withdraw::SIGNATURE_HASH {
        let ev = IMasterGardener::Withdraw::decode_log_data(&data, true)
            .map_err(|e| decode_err("Withdraw", e))?;
        return Ok(DecodedEvent::PoolWithdraw {
            version,
            pool_id: pool_id_from(ev.pid)?,
            wallet: ev.user,
            amount: ev.amount,
        });
    }
    if topic == IMasterGardener::SendGovernanceTokenReward::SIGNATURE_HASH {
        let ev = IMasterGardener::SendGovernanceTokenReward::decode_log_data(&data, true)
            .map_err(|e| decode_err("SendGovernanceTokenReward", e))?;
        return Ok(DecodedEvent::PoolReward {
            version,
            pool_id: pool_id_from(ev.pid)?,
            wallet: ev.user,
            amount: ev.amount,
            lock_amount: ev.lockAmount,
        });
    }

    Err(LedgerError::decoding(
        format!("unexpected topic for pool staking decoder: {topic}"),
        None,
    ))
}

fn decode_quest_reward(log: &Log) -> LedgerResult<DecodedEvent> {
    let data = log_payload(log);
    let ev = IQuestCore::QuestReward::decode_log_data(&data, true)
        .map_err(|e| decode_err("QuestReward", e))?;
    Ok(DecodedEvent::QuestReward {
        quest_id: ev.questId,
        player: ev.player,
        hero_id: ev.heroId,
        token: ev.rewardItem,
        amount: ev.itemQuantity,
    })
}

fn decode_combat(log: &Log) -> LedgerResult<DecodedEvent> {
    let data = log_payload(log);
    let topic = topic0(log)?;

    if topic == ICombat::EncounterResolved::SIGNATURE_HASH {
        let ev = ICombat::EncounterResolved::decode_log_data(&data, true)
            .map_err(|e| decode_err("EncounterResolved", e))?;
        return Ok(DecodedEvent::CombatEncounter {
            encounter_id: ev.encounterId,
            player: ev.player,
            hero_id: ev.heroId,
            outcome: ev.outcome,
        });
    }
    if topic == ICombat::LootDropped::SIGNATURE_HASH {
        let ev = ICombat::LootDropped::decode_log_data(&data, true)
            .map_err(|e| decode_err("LootDropped", e))?;
        return Ok(DecodedEvent::CombatLoot {
            encounter_id: ev.encounterId,
            player: ev.player,
            item: ev.item,
            amount: ev.amount,
        });
    }

    Err(LedgerError::decoding(
        format!("unexpected topic for combat decoder: {topic}"),
        None,
    ))
}

fn decode_bridge(log: &Log) -> LedgerResult<DecodedEvent> {
    let data = log_payload(log);
    let topic = topic0(log)?;

    if topic == IBridge::TokenDeposit::SIGNATURE_HASH {
        let ev = IBridge::TokenDeposit::decode_log_data(&data, true)
            .map_err(|e| decode_err("TokenDeposit", e))?;
        return Ok(DecodedEvent::BridgeTransfer {
            direction: BridgeDirection::Out,
            wallet: ev.to,
            token: ev.token,
            amount: ev.amount,
            counterparty_chain_id: u64::try_from(ev.toChainId).unwrap_or(0),
        });
    }
    if topic == IBridge::TokenWithdraw::SIGNATURE_HASH {
        let ev = IBridge::TokenWithdraw::decode_log_data(&data, true)
            .map_err(|e| decode_err("TokenWithdraw", e))?;
        return Ok(DecodedEvent::BridgeTransfer {
            direction: BridgeDirection::In,
            wallet: ev.to,
            token: ev.token,
            amount: ev.amount,
            counterparty_chain_id: u64::try_from(ev.fromChainId).unwrap_or(0),
        });
    }

    Err(LedgerError::decoding(
        format!("unexpected topic for bridge decoder: {topic}"),
        None,
    ))
}
