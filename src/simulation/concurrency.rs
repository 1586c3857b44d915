//! Loop helpers over particle attribute arrays. `parallel` and `serial` expose the
//! same functions so that solver passes can be instantiated for either backend.

pub mod serial {

    pub fn par_map_collect<T: Send, F: Fn(usize) -> T + Send + Sync>(n: usize, f: F) -> Vec<T> {
        (0..n).map(f).collect()
    }

    pub fn par_reduce0<
        F: Fn(usize) -> X + Send + Sync,
        X: Send,
        C: Fn(X, X) -> X + Send + Sync,
        I: Fn() -> X + Send + Sync,
    >(
        n: usize,
        identity: I,
        combine: C,
        f: F,
    ) -> X {
        (0..n).map(f).fold(identity(), combine)
    }

    pub fn par_iter_reduce1<
        T1: Send + Sync,
        F: Fn(usize, &mut T1) -> X + Send + Sync,
        X: Send,
        C: Fn(X, X) -> X + Send + Sync,
        I: Fn() -> X + Send + Sync,
    >(
        arr1: &mut [T1],
        identity: I,
        combine: C,
        f: F,
    ) -> X {
        arr1.iter_mut()
            .enumerate()
            .map(|(i, a)| f(i, a))
            .fold(identity(), combine)
    }

    pub fn par_iter_reduce2<
        T1: Send + Sync,
        T2: Send + Sync,
        F: Fn(usize, &mut T1, &mut T2) -> X + Send + Sync,
        X: Send,
        C: Fn(X, X) -> X + Send + Sync,
        I: Fn() -> X + Send + Sync,
    >(
        arr1: &mut [T1],
        arr2: &mut [T2],
        identity: I,
        combine: C,
        f: F,
    ) -> X {
        arr1.iter_mut()
            .zip(arr2.iter_mut())
            .enumerate()
            .map(|(i, (a, b))| f(i, a, b))
            .fold(identity(), combine)
    }
}

pub mod parallel {
    use rayon::prelude::*;

    pub fn par_map_collect<T: Send, F: Fn(usize) -> T + Send + Sync>(n: usize, f: F) -> Vec<T> {
        (0..n).into_par_iter().map(f).collect()
    }

    pub fn par_reduce0<
        F: Fn(usize) -> X + Send + Sync,
        X: Send,
        C: Fn(X, X) -> X + Send + Sync,
        I: Fn() -> X + Send + Sync,
    >(
        n: usize,
        identity: I,
        combine: C,
        f: F,
    ) -> X {
        (0..n).into_par_iter().map(f).reduce(identity, combine)
    }

    pub fn par_iter_reduce1<
        T1: Send + Sync,
        F: Fn(usize, &mut T1) -> X + Send + Sync,
        X: Send,
        C: Fn(X, X) -> X + Send + Sync,
        I: Fn() -> X + Send + Sync,
    >(
        arr1: &mut [T1],
        identity: I,
        combine: C,
        f: F,
    ) -> X {
        arr1.into_par_iter()
            .enumerate()
            .map(|(i, a)| f(i, a))
            .reduce(identity, combine)
    }

    pub fn par_iter_reduce2<
        T1: Send + Sync,
        T2: Send + Sync,
        F: Fn(usize, &mut T1, &mut T2) -> X + Send + Sync,
        X: Send,
        C: Fn(X, X) -> X + Send + Sync,
        I: Fn() -> X + Send + Sync,
    >(
        arr1: &mut [T1],
        arr2: &mut [T2],
        identity: I,
        combine: C,
        f: F,
    ) -> X {
        (arr1, arr2)
            .into_par_iter()
            .enumerate()
            .map(|(i, (a, b))| f(i, a, b))
            .reduce(identity, combine)
    }
}

#[test]
fn serial_and_parallel_reductions_agree() {
    let mut a: Vec<u64> = (0..1000).collect();
    let mut b: Vec<u64> = vec![0; 1000];
    let sum_serial = serial::par_iter_reduce2(&mut a, &mut b, || 0, |x, y| x + y, |i, a, b| {
        *b = *a * 2;
        i as u64
    });
    let doubled = b.clone();
    let sum_parallel = parallel::par_iter_reduce2(&mut a, &mut b, || 0, |x, y| x + y, |i, a, b| {
        *b = *a * 2;
        i as u64
    });
    assert_eq!(sum_serial, 999 * 1000 / 2);
    assert_eq!(sum_serial, sum_parallel);
    assert_eq!(doubled, b);
    assert_eq!(
        serial::par_map_collect(10, |i| i * i),
        parallel::par_map_collect(10, |i| i * i)
    );
    assert_eq!(
        serial::par_reduce0(100, || 0usize, |x, y| x.max(y), |i| i),
        parallel::par_reduce0(100, || 0usize, |x, y| x.max(y), |i| i)
    );
}
