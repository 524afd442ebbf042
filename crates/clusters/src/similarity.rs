/// Calculate cosine similarity between two embeddings
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
  if a.len() != b.len() {
    return 0.0;
  }

  let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
  let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
  let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

  if magnitude_a == 0.0 || magnitude_b == 0.0 {
    0.0
  } else {
    dot_product / (magnitude_a * magnitude_b)
  }
}

/// Cosine distance in [0, 2]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
  (1.0 - cosine_similarity(a, b)).clamp(0.0, 2.0)
}

/// Component-wise mean; `None` for an empty set or mismatched dimensions
pub fn centroid<'a, I>(vectors: I) -> Option<Vec<f32>>
where
  I: IntoIterator<Item = &'a [f32]>,
{
  let mut iter = vectors.into_iter();
  let first = iter.next()?;
  let mut sum = first.to_vec();
  let mut count = 1usize;
  for vector in iter {
    if vector.len() != sum.len() {
      return None;
    }
    for (acc, value) in sum.iter_mut().zip(vector) {
      *acc += value;
    }
    count += 1;
  }
  let n = count as f32;
  Some(sum.into_iter().map(|v| v / n).collect())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_identical_vectors() {
    assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
    assert!(cosine_distance(&[1.0, 2.0], &[2.0, 4.0]) < 1e-6);
  }

  #[test]
  fn test_orthogonal_and_degenerate() {
    assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 1.0]), 0.0);
    assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
  }

  #[test]
  fn test_centroid() {
    let a = [1.0, 0.0];
    let b = [0.0, 1.0];
    assert_eq!(centroid([&a[..], &b[..]]), Some(vec![0.5, 0.5]));
    assert_eq!(centroid(std::iter::empty::<&[f32]>()), None);
  }
}
