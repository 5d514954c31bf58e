//! Community geometry: centroids and inter-community edge bundles.

use std::collections::HashMap;

/// Arithmetic mean of the positioned members. `None` when no member has a
/// position yet (the layouter may not have run).
pub fn centroid(positions: &[(f64, f64, f64)]) -> Option<(f64, f64, f64)> {
    if positions.is_empty() {
        return None;
    }
    let n = positions.len() as f64;
    let (sx, sy, sz) = positions.iter().fold((0.0, 0.0, 0.0), |acc, p| {
        (acc.0 + p.0, acc.1 + p.1, acc.2 + p.2)
    });
    Some((sx / n, sy / n, sz / n))
}

/// An aggregated inter-community edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeBundle {
    pub source_community: i64,
    pub target_community: i64,
    pub weight: i64,
    pub avg_strength: Option<f64>,
    pub control_point: Option<(f64, f64, f64)>,
}

/// Aggregate links that cross communities into bundles.
///
/// `links` carries `(community_a, community_b, strength)` per underlying
/// link; intra-community entries are ignored. Pairs are ordered
/// canonically (smaller id first) so both directions of the same pair
/// land in one bundle.
pub fn bundle_links(
    links: impl IntoIterator<Item = (i64, i64, f64)>,
    centroids: &HashMap<i64, (f64, f64, f64)>,
) -> Vec<EdgeBundle> {
    let mut acc: HashMap<(i64, i64), (i64, f64)> = HashMap::new();
    for (a, b, strength) in links {
        if a == b {
            continue;
        }
        let key = if a < b { (a, b) } else { (b, a) };
        let entry = acc.entry(key).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += strength;
    }

    let mut bundles: Vec<EdgeBundle> = acc
        .into_iter()
        .map(|((a, b), (count, total_strength))| EdgeBundle {
            source_community: a,
            target_community: b,
            weight: count,
            avg_strength: (count > 0).then(|| total_strength / count as f64),
            control_point: match (centroids.get(&a), centroids.get(&b)) {
                (Some(&ca), Some(&cb)) => Some(control_point(ca, cb)),
                _ => None,
            },
        })
        .collect();
    bundles.sort_by_key(|b| (b.source_community, b.target_community));
    bundles
}

/// Midpoint of the two centroids, pushed sideways in the XY plane by 20%
/// of the inter-centroid distance so bundled edges arc instead of
/// overlapping the straight line.
pub fn control_point(a: (f64, f64, f64), b: (f64, f64, f64)) -> (f64, f64, f64) {
    let mid = ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0, (a.2 + b.2) / 2.0);
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let planar = (dx * dx + dy * dy).sqrt();
    let distance = ((b.0 - a.0).powi(2) + (b.1 - a.1).powi(2) + (b.2 - a.2).powi(2)).sqrt();
    let offset = 0.2 * distance;

    // Perpendicular in XY; when the XY direction degenerates (the segment
    // runs along Z or the centroids coincide in the plane) offset along X.
    let (px, py) = if planar > 1e-9 {
        (-dy / planar, dx / planar)
    } else {
        (1.0, 0.0)
    };

    (mid.0 + px * offset, mid.1 + py * offset, mid.2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centroid_is_the_member_mean() {
        let positions = vec![(0.0, 0.0, 0.0), (2.0, 4.0, 6.0)];
        assert_eq!(centroid(&positions), Some((1.0, 2.0, 3.0)));
        assert_eq!(centroid(&[]), None);
    }

    #[test]
    fn control_point_offsets_perpendicular_to_the_segment() {
        let a = (0.0, 0.0, 0.0);
        let b = (10.0, 0.0, 0.0);
        let (cx, cy, cz) = control_point(a, b);
        // Midpoint x, pushed off the axis by 20% of the distance in y.
        assert!((cx - 5.0).abs() < 1e-9);
        assert!((cy.abs() - 2.0).abs() < 1e-9);
        assert!(cz.abs() < 1e-9);
    }

    #[test]
    fn degenerate_xy_direction_falls_back_to_x() {
        let a = (1.0, 1.0, 0.0);
        let b = (1.0, 1.0, 10.0);
        let (cx, cy, cz) = control_point(a, b);
        assert!((cx - (1.0 + 2.0)).abs() < 1e-9);
        assert!((cy - 1.0).abs() < 1e-9);
        assert!((cz - 5.0).abs() < 1e-9);
    }

    #[test]
    fn bundles_merge_directions_and_count_links() {
        let centroids: HashMap<i64, (f64, f64, f64)> =
            [(1, (0.0, 0.0, 0.0)), (2, (4.0, 0.0, 0.0))].into();
        let bundles = bundle_links(
            vec![(1, 2, 1.0), (2, 1, 3.0), (1, 1, 99.0), (2, 2, 99.0)],
            &centroids,
        );
        assert_eq!(bundles.len(), 1);
        let bundle = &bundles[0];
        assert_eq!((bundle.source_community, bundle.target_community), (1, 2));
        assert_eq!(bundle.weight, 2);
        assert_eq!(bundle.avg_strength, Some(2.0));
        assert!(bundle.control_point.is_some());
    }

    #[test]
    fn missing_centroids_leave_the_control_point_unset() {
        let bundles = bundle_links(vec![(1, 2, 1.0)], &HashMap::new());
        assert_eq!(bundles[0].control_point, None);
    }
}
