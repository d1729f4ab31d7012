use bytemuck::pod_read_unaligned;

/// 64 位指纹的汉明距离
#[inline(always)]
pub fn hamming_u64(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// 256 位 ORB 描述子的汉明距离
#[inline(always)]
pub fn hamming_256(va: &[u8; 32], vb: &[u8; 32]) -> u32 {
    // [u8; 32] 只保证 1 字节对齐，不能直接 cast 成 &[u64]
    let va: [u64; 4] = pod_read_unaligned(va);
    let vb: [u64; 4] = pod_read_unaligned(vb);
    (va[0] ^ vb[0]).count_ones()
        + (va[1] ^ vb[1]).count_ones()
        + (va[2] ^ vb[2]).count_ones()
        + (va[3] ^ vb[3]).count_ones()
}

/// 在 `train` 中寻找与 `query` 最近的两个描述子，返回 (序号, 距离)，按距离升序
///
/// `train` 少于两个描述子时返回 None，此时无法做比值检验
pub fn two_nearest(query: &[u8; 32], train: &[[u8; 32]]) -> Option<[(usize, u32); 2]> {
    if train.len() < 2 {
        return None;
    }
    let mut best = [(usize::MAX, u32::MAX); 2];
    for (i, des) in train.iter().enumerate() {
        let d = hamming_256(query, des);
        if d < best[0].1 {
            best[1] = best[0];
            best[0] = (i, d);
        } else if d < best[1].1 {
            best[1] = (i, d);
        }
    }
    Some(best)
}

/// 最近邻/次近邻比值检验，返回通过检验的 (query 序号, train 序号)
///
/// 只有最近距离明显小于次近距离（`d1 < ratio * d2`）时才保留该匹配
pub fn ratio_matches(query: &[[u8; 32]], train: &[[u8; 32]], ratio: f32) -> Vec<(usize, usize)> {
    if query.len() < 2 {
        return vec![];
    }
    query
        .iter()
        .enumerate()
        .filter_map(|(qi, des)| {
            let [(ti, d1), (_, d2)] = two_nearest(des, train)?;
            ((d1 as f32) < ratio * d2 as f32).then_some((qi, ti))
        })
        .collect()
}
