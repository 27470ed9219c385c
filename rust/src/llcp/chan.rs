// Copyright 2023 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bluetooth Core, Vol 6, Part B, 4.5.8 (Data channel index selection)

/// Number of data channels.
pub const NUM_DATA_CHANNELS: u8 = 37;

/// Channel map with every data channel in use.
pub const ALL_DATA_CHANNELS: u64 = (1 << NUM_DATA_CHANNELS) - 1;

/// Set of used data channels, one bit per channel index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelMap(u64);

impl ChannelMap {
    /// Build a channel map from a raw 37-bit mask. The map must select at
    /// least two channels and must not set any bit at or above 37.
    pub fn new(mask: u64) -> Option<ChannelMap> {
        ChannelMap::is_valid(mask).then_some(ChannelMap(mask))
    }

    pub fn all() -> ChannelMap {
        ChannelMap(ALL_DATA_CHANNELS)
    }

    pub fn is_valid(mask: u64) -> bool {
        mask & !ALL_DATA_CHANNELS == 0 && mask.count_ones() >= 2
    }

    pub fn mask(self) -> u64 {
        self.0
    }

    pub fn num_used(self) -> u8 {
        self.0.count_ones() as u8
    }

    pub fn is_used(self, channel: u8) -> bool {
        channel < NUM_DATA_CHANNELS && (self.0 >> channel) & 1 != 0
    }

    /// Used channel indices in ascending order.
    pub fn remapping_table(self) -> RemapTable {
        let mut table = RemapTable { channels: [0; NUM_DATA_CHANNELS as usize], len: 0 };
        for channel in (0..NUM_DATA_CHANNELS).filter(|channel| self.is_used(*channel)) {
            table.channels[table.len as usize] = channel;
            table.len += 1;
        }
        table
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemapTable {
    channels: [u8; NUM_DATA_CHANNELS as usize],
    len: u8,
}

impl RemapTable {
    pub fn get(&self, index: usize) -> u8 {
        self.channels[index % self.len.max(1) as usize]
    }

    pub fn len(&self) -> u8 {
        self.len
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    Csa1,
    Csa2,
}

/// Channel selection state of a connection.
#[derive(Clone, Copy, Debug)]
pub struct ChannelSelection {
    pub algorithm: Algorithm,
    pub map: ChannelMap,
    pub remap: RemapTable,
    /// CSA#1 hop increment (5..=16).
    pub hop_increment: u8,
    /// CSA#1 last unmapped channel.
    pub last_unmapped: u8,
    /// CSA#2 channel identifier derived from the access address.
    pub channel_id: u16,
}

impl ChannelSelection {
    pub fn new(
        algorithm: Algorithm,
        map: ChannelMap,
        hop_increment: u8,
        access_address: u32,
    ) -> Self {
        ChannelSelection {
            algorithm,
            map,
            remap: map.remapping_table(),
            hop_increment,
            last_unmapped: 0,
            channel_id: channel_identifier(access_address),
        }
    }

    pub fn set_map(&mut self, map: ChannelMap) {
        self.map = map;
        self.remap = map.remapping_table();
    }

    /// Select the data channel of connection event `event_counter`.
    /// CSA#1 is stateful and must be called exactly once per event,
    /// skipped events included.
    pub fn next_channel(&mut self, event_counter: u16) -> u8 {
        match self.algorithm {
            Algorithm::Csa1 => {
                let (unmapped, channel) =
                    csa1(self.last_unmapped, self.hop_increment, &self.map, &self.remap);
                self.last_unmapped = unmapped;
                channel
            }
            Algorithm::Csa2 => csa2(event_counter, self.channel_id, &self.map, &self.remap),
        }
    }
}

/// Channel Selection Algorithm #1. Returns the new unmapped channel
/// and the channel to use.
pub fn csa1(
    last_unmapped: u8,
    hop_increment: u8,
    map: &ChannelMap,
    remap: &RemapTable,
) -> (u8, u8) {
    let unmapped = (last_unmapped + hop_increment) % NUM_DATA_CHANNELS;
    if map.is_used(unmapped) {
        (unmapped, unmapped)
    } else {
        (unmapped, remap.get((unmapped % remap.len().max(1)) as usize))
    }
}

pub fn channel_identifier(access_address: u32) -> u16 {
    ((access_address >> 16) as u16) ^ (access_address as u16)
}

// Reverse the bit order within each octet.
fn perm(value: u16) -> u16 {
    let [low, high] = value.to_le_bytes();
    u16::from_le_bytes([low.reverse_bits(), high.reverse_bits()])
}

// Multiply, add and modulo 2^16.
fn mam(a: u16, b: u16) -> u16 {
    a.wrapping_mul(17).wrapping_add(b)
}

fn prn_e(event_counter: u16, channel_id: u16) -> u16 {
    let mut prn = event_counter ^ channel_id;
    for _ in 0..3 {
        prn = mam(perm(prn), channel_id);
    }
    prn ^ channel_id
}

/// Channel Selection Algorithm #2.
pub fn csa2(event_counter: u16, channel_id: u16, map: &ChannelMap, remap: &RemapTable) -> u8 {
    let prn_e = prn_e(event_counter, channel_id);
    let unmapped = (prn_e % NUM_DATA_CHANNELS as u16) as u8;
    if map.is_used(unmapped) {
        unmapped
    } else {
        let index = (remap.len() as u32 * prn_e as u32) >> 16;
        remap.get(index as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCESS_ADDRESS: u32 = 0x8e89bed6;

    #[test]
    fn channel_map_validity() {
        assert!(ChannelMap::new(0b1).is_none());
        assert!(ChannelMap::new(0).is_none());
        assert!(ChannelMap::new(1 << 37 | 0b11).is_none());
        assert!(ChannelMap::new(1 << 39 | 0b11).is_none());
        assert!(ChannelMap::new(0b11).is_some());
        assert!(ChannelMap::new(1 << 36 | 1).is_some());
        assert_eq!(ChannelMap::all().num_used(), 37);
    }

    #[test]
    fn channel_identifier_from_access_address() {
        assert_eq!(channel_identifier(ACCESS_ADDRESS), 0x305f);
    }

    // Bluetooth Core, Vol 6, Part C, 3.1 (sample data 1)
    #[test]
    fn csa2_all_channels() {
        let map = ChannelMap::all();
        let remap = map.remapping_table();
        let channels: Vec<u8> = (0..4).map(|counter| csa2(counter, 0x305f, &map, &remap)).collect();
        assert_eq!(channels, vec![25, 20, 6, 21]);
    }

    // Bluetooth Core, Vol 6, Part C, 3.2 (sample data 2)
    #[test]
    fn csa2_nine_channels() {
        let map = ChannelMap::new(0x1e_00e0_0600).unwrap();
        assert_eq!(map.num_used(), 9);
        let remap = map.remapping_table();
        let channels: Vec<u8> = (0..4).map(|counter| csa2(counter, 0x305f, &map, &remap)).collect();
        assert_eq!(channels, vec![35, 9, 33, 21]);
    }

    #[test]
    fn csa1_hops_and_remaps() {
        let mut selection =
            ChannelSelection::new(Algorithm::Csa1, ChannelMap::all(), 7, ACCESS_ADDRESS);
        let channels: Vec<u8> = (0..5).map(|counter| selection.next_channel(counter)).collect();
        assert_eq!(channels, vec![7, 14, 21, 28, 35]);

        let mut selection = ChannelSelection::new(
            Algorithm::Csa1,
            ChannelMap::new(0x1e_00e0_0600).unwrap(),
            7,
            ACCESS_ADDRESS,
        );
        let channels: Vec<u8> = (0..5).map(|counter| selection.next_channel(counter)).collect();
        assert_eq!(channels, vec![35, 33, 21, 10, 35]);
    }

    #[test]
    fn remapping_table_is_sorted() {
        let table = ChannelMap::new(1 << 30 | 1 << 3 | 1 << 17).unwrap().remapping_table();
        assert_eq!(table.len(), 3);
        assert_eq!((table.get(0), table.get(1), table.get(2)), (3, 17, 30));
    }
}
