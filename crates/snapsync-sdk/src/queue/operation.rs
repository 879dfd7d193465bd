//! 操作记录
//!
//! 操作日志的 value：一个按操作族打标签的联合体，只携带目标实体的本地 id，
//! 外加设备内唯一的 operation id、客户端时间戳与统计标签。

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::queue::stats::STAT_UNIT;
use crate::storage::entities::EntityRef;

/// 操作族：每个族对应一个 In-Flight 槽位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpFamily {
    DownloadPhoto,
    UploadPhoto,
    UploadEpisode,
    UploadActivity,
    UpdateViewpoint,
    UpdatePhoto,
    RemovePhotos,
}

impl OpFamily {
    pub const ALL: [OpFamily; 7] = [
        OpFamily::DownloadPhoto,
        OpFamily::UploadPhoto,
        OpFamily::UploadEpisode,
        OpFamily::UploadActivity,
        OpFamily::UpdateViewpoint,
        OpFamily::UpdatePhoto,
        OpFamily::RemovePhotos,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpFamily::DownloadPhoto => "download_photo",
            OpFamily::UploadPhoto => "upload_photo",
            OpFamily::UploadEpisode => "upload_episode",
            OpFamily::UploadActivity => "upload_activity",
            OpFamily::UpdateViewpoint => "update_viewpoint",
            OpFamily::UpdatePhoto => "update_photo",
            OpFamily::RemovePhotos => "remove_photos",
        }
    }
}

impl std::fmt::Display for OpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 操作本体：每个变体携带目标实体的本地 id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    DownloadPhoto { photo_id: i64 },
    UploadPhoto { photo_id: i64 },
    UploadEpisode { episode_id: i64 },
    UploadActivity { activity_id: i64 },
    UpdateViewpoint { viewpoint_id: i64 },
    UpdatePhoto { photo_id: i64 },
    RemovePhotos { photo_id: i64 },
}

impl Operation {
    pub fn family(&self) -> OpFamily {
        match self {
            Operation::DownloadPhoto { .. } => OpFamily::DownloadPhoto,
            Operation::UploadPhoto { .. } => OpFamily::UploadPhoto,
            Operation::UploadEpisode { .. } => OpFamily::UploadEpisode,
            Operation::UploadActivity { .. } => OpFamily::UploadActivity,
            Operation::UpdateViewpoint { .. } => OpFamily::UpdateViewpoint,
            Operation::UpdatePhoto { .. } => OpFamily::UpdatePhoto,
            Operation::RemovePhotos { .. } => OpFamily::RemovePhotos,
        }
    }

    pub fn target(&self) -> EntityRef {
        match *self {
            Operation::DownloadPhoto { photo_id }
            | Operation::UploadPhoto { photo_id }
            | Operation::UpdatePhoto { photo_id }
            | Operation::RemovePhotos { photo_id } => EntityRef::Photo(photo_id),
            Operation::UploadEpisode { episode_id } => EntityRef::Episode(episode_id),
            Operation::UploadActivity { activity_id } => EntityRef::Activity(activity_id),
            Operation::UpdateViewpoint { viewpoint_id } => EntityRef::Viewpoint(viewpoint_id),
        }
    }

    pub fn target_id(&self) -> i64 {
        match self.target() {
            EntityRef::Photo(id)
            | EntityRef::Episode(id)
            | EntityRef::Activity(id)
            | EntityRef::Viewpoint(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHeader {
    /// 设备内唯一
    pub op_id: String,
    pub client_timestamp_ms: i64,
}

impl OperationHeader {
    pub fn new(client_timestamp_ms: i64) -> Self {
        Self {
            op_id: uuid::Uuid::new_v4().to_string(),
            client_timestamp_ms,
        }
    }
}

/// 进度统计标签（仅用于观测）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatTag {
    pub label: String,
    /// 千分之一为单位的权重
    pub milli_units: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub header: OperationHeader,
    pub operation: Operation,
    pub stats: Vec<StatTag>,
}

impl OperationRecord {
    pub fn new(operation: Operation, client_timestamp_ms: i64) -> Self {
        Self {
            header: OperationHeader::new(client_timestamp_ms),
            operation,
            stats: Vec::new(),
        }
    }

    pub fn with_stats(mut self, stats: Vec<StatTag>) -> Self {
        self.stats = stats;
        self
    }

    /// 该记录对 StatsMap 的贡献；没有标签时按一个完整条目计
    pub fn stat_units(&self) -> i64 {
        if self.stats.is_empty() {
            STAT_UNIT
        } else {
            self.stats.iter().map(|s| s.milli_units).sum()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// 把一个完整单位按标签均分，余数并入最后一个，保证合计恰为 STAT_UNIT
pub fn split_stat_unit(labels: &[&str]) -> Vec<StatTag> {
    if labels.is_empty() {
        return Vec::new();
    }
    let share = STAT_UNIT / labels.len() as i64;
    let mut tags: Vec<StatTag> = labels
        .iter()
        .map(|label| StatTag {
            label: (*label).to_string(),
            milli_units: share,
        })
        .collect();
    if let Some(last) = tags.last_mut() {
        last.milli_units += STAT_UNIT - share * labels.len() as i64;
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_survives_encoding() {
        let record = OperationRecord::new(Operation::UploadActivity { activity_id: 9 }, 1_700_000_000_000)
            .with_stats(split_stat_unit(&["share"]));
        let decoded = OperationRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.operation.family(), OpFamily::UploadActivity);
        assert_eq!(decoded.operation.target(), EntityRef::Activity(9));
    }

    #[test]
    fn test_split_stat_unit_sums_to_one() {
        let tags = split_stat_unit(&["tn", "full", "orig"]);
        assert_eq!(tags.len(), 3);
        assert_eq!(tags.iter().map(|t| t.milli_units).sum::<i64>(), STAT_UNIT);
        assert_eq!(tags[0].milli_units, 333);
        assert_eq!(tags[2].milli_units, 334);
    }

    #[test]
    fn test_untagged_record_counts_as_one() {
        let record = OperationRecord::new(Operation::RemovePhotos { photo_id: 1 }, 0);
        assert_eq!(record.stat_units(), STAT_UNIT);
    }

    #[test]
    fn test_op_ids_are_unique() {
        let a = OperationHeader::new(0);
        let b = OperationHeader::new(0);
        assert_ne!(a.op_id, b.op_id);
    }
}
