//! SPS / PPS 存储.

use std::collections::HashMap;

use mirra_core::{MirraError, MirraResult};

use super::pps::Pps;
use super::sps::Sps;

/// 按 id 保存已解析的参数集, 新到达的同 id 参数集覆盖旧值
#[derive(Debug, Clone, Default)]
pub struct ParameterSets {
    sps_map: HashMap<u32, Sps>,
    pps_map: HashMap<u32, Pps>,
    last_sps_id: Option<u32>,
    last_pps_id: Option<u32>,
}

impl ParameterSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保存 SPS, 返回是否替换了内容不同的旧 SPS
    pub fn insert_sps(&mut self, sps: Sps) -> bool {
        let id = sps.sps_id;
        self.last_sps_id = Some(id);
        match self.sps_map.insert(id, sps) {
            Some(old) => self.sps_map.get(&id) != Some(&old),
            None => false,
        }
    }

    pub fn insert_pps(&mut self, pps: Pps) {
        self.last_pps_id = Some(pps.pps_id);
        self.pps_map.insert(pps.pps_id, pps);
    }

    pub fn sps(&self, id: u32) -> Option<&Sps> {
        self.sps_map.get(&id)
    }

    pub fn pps(&self, id: u32) -> Option<&Pps> {
        self.pps_map.get(&id)
    }

    /// 最近一次到达的 SPS
    pub fn active_sps(&self) -> Option<&Sps> {
        self.last_sps_id.and_then(|id| self.sps_map.get(&id))
    }

    /// 最近一次到达的 PPS
    pub fn active_pps(&self) -> Option<&Pps> {
        self.last_pps_id.and_then(|id| self.pps_map.get(&id))
    }

    /// 全部 SPS (按 id 排序)
    pub fn sps_list(&self) -> Vec<&Sps> {
        let mut list: Vec<&Sps> = self.sps_map.values().collect();
        list.sort_by_key(|sps| sps.sps_id);
        list
    }

    /// 全部 PPS (按 id 排序)
    pub fn pps_list(&self) -> Vec<&Pps> {
        let mut list: Vec<&Pps> = self.pps_map.values().collect();
        list.sort_by_key(|pps| pps.pps_id);
        list
    }

    /// 由 pps_id 找到 PPS 及其引用的 SPS
    pub fn resolve(&self, pps_id: u32) -> MirraResult<(&Sps, &Pps)> {
        let pps = self
            .pps(pps_id)
            .ok_or_else(|| MirraError::MissingParameterSet(format!("PPS id={}", pps_id)))?;
        let sps = self.sps(pps.sps_id).ok_or_else(|| {
            MirraError::MissingParameterSet(format!("SPS id={} (PPS id={})", pps.sps_id, pps_id))
        })?;
        Ok((sps, pps))
    }

    pub fn is_empty(&self) -> bool {
        self.sps_map.is_empty() && self.pps_map.is_empty()
    }

    pub fn clear(&mut self) {
        self.sps_map.clear();
        self.pps_map.clear();
        self.last_sps_id = None;
        self.last_pps_id = None;
    }
}
