//! Typed on-chain events with compile-time safety.
//!
//! This module uses Alloy's `sol!` macro to generate type-safe event
//! structures directly from Solidity signatures: event signatures are
//! validated at compile time, topic and data decoding is automatic, and
//! there are no ABI JSON files to keep in sync.
//!
//! Decoded logs are normalized into [`DecodedEvent`], the single record type
//! every indexer sink, the payment matcher and the valuation engine consume.
//! The raw wire shape differs per contract; the normalized shape is stable.

use alloy::primitives::{Address, U256};
use alloy::sol;
use serde::{Deserialize, Serialize};

pub mod registry;

pub use registry::DecoderRegistry;

sol! {
    /// Minimal ERC-20 surface: the Transfer event drives both the payment
    /// matcher and the jeweler mint/burn derivation; balanceOf feeds the
    /// daily wallet snapshots.
    #[sol(rpc)]
    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
        function balanceOf(address owner) external view returns (uint256);
    }

    /// LP staking master contract, emitted identically by the V1 and V2
    /// deployments; the version tag comes from the subscription, not the
    /// ABI. The read functions drive pool discovery at startup.
    #[sol(rpc)]
    interface IMasterGardener {
        event Deposit(address indexed user, uint256 indexed pid, uint256 amount);
        event Withdraw(address indexed user, uint256 indexed pid, uint256 amount);
        event SendGovernanceTokenReward(address indexed user, uint256 indexed pid, uint256 amount, uint256 lockAmount);

        function poolLength() external view returns (uint256);
        function poolInfo(uint256 pid) external view returns (address lpToken, uint256 allocPoint, uint256 lastRewardBlock, uint256 accGovTokenPerShare);
    }

    /// Gardening-quest reward mints.
    #[sol(rpc)]
    interface IQuestCore {
        event QuestReward(uint256 indexed questId, address indexed player, uint256 heroId, address rewardItem, uint256 itemQuantity);
    }

    /// PvE encounter lifecycle and loot.
    #[sol(rpc)]
    interface ICombat {
        event EncounterResolved(uint256 indexed encounterId, address indexed player, uint256 heroId, uint8 outcome);
        event LootDropped(uint256 indexed encounterId, address indexed player, address item, uint256 amount);
    }

    /// Cross-chain bridge endpoints.
    #[sol(rpc)]
    interface IBridge {
        event TokenDeposit(address indexed to, address token, uint256 amount, uint256 toChainId);
        event TokenWithdraw(address indexed to, address token, uint256 amount, uint256 fromChainId);
    }

    /// Read-only LP pair surface used by the valuation engine.
    #[sol(rpc)]
    interface IUniswapV2Pair {
        function totalSupply() external view returns (uint256);
        function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast);
        function token0() external view returns (address);
        function token1() external view returns (address);
    }
}

/// Master contract generation an LP staking event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GardenVersion {
    /// Original master gardener deployment
    V1,
    /// Reworked deployment with locked-reward split
    V2,
}

impl GardenVersion {
    /// Short tag used in DB columns and log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }
}

/// Direction of a bridge transfer relative to the indexed chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeDirection {
    /// Funds arriving onto this chain
    In,
    /// Funds leaving this chain
    Out,
}

impl BridgeDirection {
    /// Short tag used in DB columns and log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

/// Logical stream an event belongs to; selects the broadcast channel and
/// the consumers interested in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// LP pool staking (V1/V2 deposits, withdrawals, rewards)
    PoolStaking,
    /// cJEWEL locked staking (mint/burn)
    JewelerStaking,
    /// Gardening-quest reward mints
    QuestRewards,
    /// Cross-chain bridge flow
    Bridge,
    /// PvE/PvP combat activity and loot
    Combat,
    /// ERC-20 transfers (payment matching input)
    Transfers,
}

impl StreamKind {
    /// Stable string tag, used as the DB discriminator column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PoolStaking => "pool_staking",
            Self::JewelerStaking => "jeweler_staking",
            Self::QuestRewards => "quest_rewards",
            Self::Bridge => "bridge",
            Self::Combat => "combat",
            Self::Transfers => "transfers",
        }
    }
}

/// A decoded, normalized on-chain event.
///
/// Serialized (tagged) into the `payload` JSON column of the event table;
/// the variants mirror the decoder set in [`registry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecodedEvent {
    /// ERC-20 transfer between two wallets.
    Erc20Transfer {
        /// Token contract
        token: Address,
        /// Sender
        from: Address,
        /// Recipient
        to: Address,
        /// Raw amount in token wei
        amount: U256,
    },
    /// Native-coin transfer, synthesized by the native scanner.
    NativeTransfer {
        /// Sender
        from: Address,
        /// Recipient
        to: Address,
        /// Raw amount in wei
        amount: U256,
    },
    /// LP tokens staked into a pool.
    PoolDeposit {
        /// Master contract generation
        version: GardenVersion,
        /// Pool id within the master contract
        pool_id: u64,
        /// Staking wallet
        wallet: Address,
        /// LP amount in wei
        amount: U256,
    },
    /// LP tokens unstaked from a pool.
    PoolWithdraw {
        /// Master contract generation
        version: GardenVersion,
        /// Pool id within the master contract
        pool_id: u64,
        /// Unstaking wallet
        wallet: Address,
        /// LP amount in wei
        amount: U256,
    },
    /// Governance-token reward paid out of a pool.
    PoolReward {
        /// Master contract generation
        version: GardenVersion,
        /// Pool id within the master contract
        pool_id: u64,
        /// Rewarded wallet
        wallet: Address,
        /// Liquid reward amount in wei
        amount: U256,
        /// Locked reward amount in wei (zero on V1)
        lock_amount: U256,
    },
    /// cJEWEL minted (tokens locked at the jeweler).
    JewelerMint {
        /// Wallet that locked
        wallet: Address,
        /// Minted amount in wei
        amount: U256,
    },
    /// cJEWEL burned (locked position exited).
    JewelerBurn {
        /// Wallet that exited
        wallet: Address,
        /// Burned amount in wei
        amount: U256,
    },
    /// Gardening-quest reward mint.
    QuestReward {
        /// Quest instance id
        quest_id: U256,
        /// Rewarded player
        player: Address,
        /// Hero that ran the quest
        hero_id: U256,
        /// Rewarded token/item contract
        token: Address,
        /// Reward amount in wei (or item quantity)
        amount: U256,
    },
    /// PvE encounter resolution.
    CombatEncounter {
        /// Encounter id
        encounter_id: U256,
        /// Player wallet
        player: Address,
        /// Hero that fought
        hero_id: U256,
        /// Raw outcome code from the contract
        outcome: u8,
    },
    /// Loot dropped from a PvE encounter.
    CombatLoot {
        /// Encounter id
        encounter_id: U256,
        /// Player wallet
        player: Address,
        /// Dropped item contract
        item: Address,
        /// Quantity in wei
        amount: U256,
    },
    /// Cross-chain bridge transfer.
    BridgeTransfer {
        /// Direction relative to the indexed chain
        direction: BridgeDirection,
        /// Wallet on this chain
        wallet: Address,
        /// Bridged token
        token: Address,
        /// Raw amount in wei
        amount: U256,
        /// The chain on the other side of the bridge
        counterparty_chain_id: u64,
    },
}

impl DecodedEvent {
    /// The logical stream this event belongs to.
    #[must_use]
    pub const fn stream(&self) -> StreamKind {
        match self {
            Self::Erc20Transfer { .. } | Self::NativeTransfer { .. } => StreamKind::Transfers,
            Self::PoolDeposit { .. } | Self::PoolWithdraw { .. } | Self::PoolReward { .. } => {
                StreamKind::PoolStaking
            }
            Self::JewelerMint { .. } | Self::JewelerBurn { .. } => StreamKind::JewelerStaking,
            Self::QuestReward { .. } => StreamKind::QuestRewards,
            Self::CombatEncounter { .. } | Self::CombatLoot { .. } => StreamKind::Combat,
            Self::BridgeTransfer { .. } => StreamKind::Bridge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolEvent;

    #[test]
    fn test_event_signatures_are_distinct() {
        let sigs = [
            IERC20::Transfer::SIGNATURE_HASH,
            IMasterGardener::Deposit::SIGNATURE_HASH,
            IMasterGardener::Withdraw::SIGNATURE_HASH,
            IMasterGardener::SendGovernanceTokenReward::SIGNATURE_HASH,
            IQuestCore::QuestReward::SIGNATURE_HASH,
            ICombat::EncounterResolved::SIGNATURE_HASH,
            ICombat::LootDropped::SIGNATURE_HASH,
            IBridge::TokenDeposit::SIGNATURE_HASH,
            IBridge::TokenWithdraw::SIGNATURE_HASH,
        ];
        for (i, a) in sigs.iter().enumerate() {
            for b in sigs.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_stream_routing() {
        let transfer = DecodedEvent::Erc20Transfer {
            token: Address::ZERO,
            from: Address::ZERO,
            to: Address::ZERO,
            amount: U256::ZERO,
        };
        assert_eq!(transfer.stream(), StreamKind::Transfers);

        let deposit = DecodedEvent::PoolDeposit {
            version: GardenVersion::V2,
            pool_id: 3,
            wallet: Address::ZERO,
            amount: U256::from(1u64),
        };
        assert_eq!(deposit.stream(), StreamKind::PoolStaking);
    }

    #[test]
    fn test_payload_round_trip() {
        let event = DecodedEvent::QuestReward {
            quest_id: U256::from(77u64),
            player: Address::repeat_byte(0xaa),
            hero_id: U256::from(123_456u64),
            token: Address::repeat_byte(0xbb),
            amount: U256::from(10u64).pow(U256::from(18u64)),
        };

        let json = serde_json::to_string(&event).unwrap();
        let back: DecodedEvent = serde_json::from_str(&json).unwrap();
        match back {
            DecodedEvent::QuestReward { hero_id, .. } => {
                assert_eq!(hero_id, U256::from(123_456u64));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
