//! Installs the allocator as the global allocator, backed by the program
//! break. Every collection in this program draws from it.

#[cfg(unix)]
mod demo {
    use segalloc::{Sbrk, Segalloc};

    #[global_allocator]
    static ALLOCATOR: Segalloc<Sbrk> = Segalloc::new();

    pub fn run() {
        let mut numbers = Vec::new();
        for i in 0..1000 {
            numbers.push(i * i);
        }
        assert_eq!(numbers[31], 961);

        let sentence: String = vec!["all", "of", "this", "came", "from", "sbrk"].join(" ");
        println!("{sentence}");

        drop(numbers);
        drop(sentence);

        println!("checker found {} errors", ALLOCATOR.check_heap(false));
    }
}

#[cfg(unix)]
fn main() {
    demo::run();
}

#[cfg(not(unix))]
fn main() {
    println!("this demo needs a program break, which only Unix provides");
}
