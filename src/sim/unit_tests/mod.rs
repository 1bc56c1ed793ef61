#[cfg(test)]
mod endpoint;
#[cfg(test)]
mod interconnect_tests;
#[cfg(test)]
mod memory_tests;
#[cfg(test)]
mod system_tests;
