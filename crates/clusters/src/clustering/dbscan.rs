//! Density-based clustering over cosine distance

use crate::similarity::cosine_distance;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DbscanParams {
  /// Neighborhood radius
  pub eps: f32,
  /// Points within `eps` (counting the point itself) required for a core point
  pub min_samples: usize,
}

#[derive(Clone, Copy, PartialEq)]
enum Label {
  Unvisited,
  Noise,
  Cluster(usize),
}

/// Cluster `points` and return each group as indices into the input.
///
/// Noise points are omitted. Results are deterministic for a given input
/// order: groups are numbered in order of their first core point.
pub fn dbscan(points: &[&[f32]], params: DbscanParams) -> Vec<Vec<usize>> {
  let n = points.len();
  let neighbors: Vec<Vec<usize>> = (0..n)
    .map(|i| (0..n).filter(|&j| cosine_distance(points[i], points[j]) <= params.eps).collect())
    .collect();

  let mut labels = vec![Label::Unvisited; n];
  let mut next_cluster = 0;

  for i in 0..n {
    if labels[i] != Label::Unvisited {
      continue;
    }
    if neighbors[i].len() < params.min_samples {
      labels[i] = Label::Noise;
      continue;
    }

    let cluster = next_cluster;
    next_cluster += 1;
    labels[i] = Label::Cluster(cluster);

    let mut frontier: Vec<usize> = neighbors[i].clone();
    while let Some(j) = frontier.pop() {
      match labels[j] {
        Label::Cluster(_) => continue,
        // Border point previously marked noise joins the cluster but does not expand it
        Label::Noise => labels[j] = Label::Cluster(cluster),
        Label::Unvisited => {
          labels[j] = Label::Cluster(cluster);
          if neighbors[j].len() >= params.min_samples {
            frontier.extend(neighbors[j].iter().copied());
          }
        }
      }
    }
  }

  let mut groups = vec![Vec::new(); next_cluster];
  for (i, label) in labels.iter().enumerate() {
    if let Label::Cluster(c) = label {
      groups[*c].push(i);
    }
  }
  groups
}
