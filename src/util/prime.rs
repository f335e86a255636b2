//! Prime sizes for open-addressed hash tables
//!
//! Table sizes grow along a fixed list of primes, each roughly 1.15 times
//! the previous one. Probe steps are small primes that never divide any
//! table size, so a probe sequence visits every slot.

/// Table sizes, ratio ~1.15, starting at the minimum table size
pub const PRIMES: &[u32] = &[
    17, 23, 29, 37, 43, 53, 61, 71, 83, 97, 113, 131, 151, 179, 211, 251, 293, 337, 389, 449, 521,
    601, 701, 809, 937, 1087, 1259, 1451, 1669, 1931, 2221, 2557, 2953, 3407, 3919, 4507, 5189,
    5981, 6883, 7919, 9109, 10477, 12049, 13859, 15959, 18353, 21107, 24281, 27941, 32141, 36973,
    42533, 48947, 56299, 64747, 74471, 85643, 98491, 113279, 130279, 149827, 172307, 198173,
    227947, 262147, 301471, 346699, 398711, 458531, 527327, 606433, 697399, 802019, 922331,
    1060687, 1219793, 1402763, 1613179, 1855169, 2133463, 2453483, 2821513, 3244741, 3731461,
    4291181, 4934863, 5675107, 6526379, 7505341, 8631151, 9925837, 11414729, 13126957, 15096019,
    17360449, 19964533, 22959247, 26403187, 30363677, 34918229, 40155977, 46179389, 53106299,
    61072273, 70233167, 80768159, 92883389, 106815949, 122838367, 141264127, 162453793,
    186821863, 214845143, 247071917, 284132711, 326752619, 375765587, 432130427, 496950007,
    571492511, 657216407, 755798933, 869168803, 999544141, 1149475763,
];

/// Probe steps indexed by the low five bits of a hash
pub const PROBE_STEPS: [u32; 32] = [
    2, 3, 5, 7, 11, 13, 19, 31, 41, 47, 59, 67, 73, 79, 89, 101, 103, 107, 109, 127, 137, 139,
    149, 157, 163, 167, 173, 181, 191, 193, 197, 199,
];

/// Smallest table size
pub const MIN_SIZE: usize = 17;

/// First table prime that is `>= n`, or `None` if `n` exceeds the table
pub fn prime_at_least(n: usize) -> Option<usize> {
    let idx = PRIMES.partition_point(|&p| (p as usize) < n);
    PRIMES.get(idx).map(|&p| p as usize)
}

/// Probe step for a hash value
#[inline]
pub fn probe_step(hash: u32) -> usize {
    PROBE_STEPS[(hash & 31) as usize] as usize
}
